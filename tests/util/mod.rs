#![allow(dead_code)]

use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn assert_send<T: Send>() {}

pub fn assert_sync<T: Sync>() {}

#[cfg(unix)]
pub fn raw<T: std::os::fd::AsRawFd>(io: &T) -> rookery::OsSocket {
    io.as_raw_fd()
}

#[cfg(windows)]
pub fn raw<T: std::os::windows::io::AsRawSocket>(io: &T) -> rookery::OsSocket {
    io.as_raw_socket() as rookery::OsSocket
}
