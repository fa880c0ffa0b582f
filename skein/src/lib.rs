// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

pub mod common;
pub mod ext;
pub mod util;

pub mod client;
pub mod server;
