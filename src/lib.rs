// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod retry;

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod fetch;
pub mod pool;
pub mod publisher;
pub mod subscriber;
pub mod topology;
