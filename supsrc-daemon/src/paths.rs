//! Daemon runtime paths: data directory, Unix socket, PID file, all under
//! `~/.supsrc/`.

use std::path::PathBuf;

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
    .expect("cannot find home directory")
    .join(".supsrc")
}

pub fn socket_path() -> PathBuf {
    data_dir().join("daemon.sock")
}

pub fn pid_file() -> PathBuf {
    data_dir().join("daemon.pid")
}

pub fn ensure_data_dir() -> std::io::Result<()> {
    let dir = data_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
