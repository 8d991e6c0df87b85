pub(crate) mod async_task;
mod backoff;

pub use backoff::*;

#[cfg(test)]
mod async_task_test;
#[cfg(test)]
mod backoff_test;
