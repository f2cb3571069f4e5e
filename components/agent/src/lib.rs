pub mod cli;
pub mod config;
pub mod consumer;
pub mod encrypters;
pub mod helpers;
pub mod instrumentation;
pub mod queue;
pub mod runtime;
pub mod sincedb;
pub mod tailer;
pub mod transports;
pub mod tunnel;
