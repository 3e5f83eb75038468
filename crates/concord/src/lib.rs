// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod lock;
pub mod round;
pub mod session;
pub mod store;
pub mod test_support;
pub mod topic;
