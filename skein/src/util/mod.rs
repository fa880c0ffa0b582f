// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod adapter;
pub mod cancellation;
pub mod dropkick;
pub mod duplex;
pub mod scheduler;
pub mod tls;
pub mod validators;
