//! Integration tests

mod support;

mod test_devices;
mod test_fetcher;
mod test_fsm;
