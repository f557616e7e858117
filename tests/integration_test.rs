mod common;
mod dedup_failover;
mod watch_pipeline;
