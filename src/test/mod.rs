// Copyright (c) 2025 NaturalIO

mod test_thread;

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::path;
use std::sync::mpsc::Sender;

use crate::ClosureCb;

pub struct TempDevFile(pub String);

impl std::ops::Deref for TempDevFile {
    type Target = String;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for TempDevFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(path::Path::new(&self.0));
        info!("deleted {}", self.0);
    }
}

impl AsRef<path::Path> for TempDevFile {
    fn as_ref(&self) -> &std::path::Path {
        &path::Path::new(&self.0)
    }
}

// Create a temporary file name within the temporary directory configured in the environment.
pub fn make_temp_file() -> TempDevFile {
    let mut result = std::env::temp_dir();
    let filename = format!("test-file-aio-{}.dat", fastrand::u64(..));
    debug!("make_temp_file {}", filename);
    result.push(filename);
    TempDevFile(result.to_str().unwrap().to_string())
}

pub fn setup_log() {
    use captains_log::recipe::stderr_logger;
    let log_config = stderr_logger(log::Level::Debug).test();
    let _ = log_config.build();
}

// Create a temporary file opened for buffered read/write.
pub fn create_temp_file(path: &path::Path) -> OwnedFd {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .expect("openfile")
        .into()
}

// Callback that funnels the raw completion code into a channel.
pub fn send_result(tx: &Sender<i64>) -> ClosureCb {
    let tx = tx.clone();
    ClosureCb(Box::new(move |res| {
        let _ = tx.send(res);
    }))
}
