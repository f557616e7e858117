pub mod async_task;
pub mod backoff;
pub mod time;

#[cfg(test)]
mod backoff_test;
