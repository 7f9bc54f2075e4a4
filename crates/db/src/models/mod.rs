pub mod run;
pub mod run_event;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_utils;
