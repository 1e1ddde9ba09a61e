use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::BenchError;

/// Replaces whatever is at `path` with a fresh named pipe.
pub fn create(path: &Path) -> Result<(), BenchError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(BenchError::io(format!("unlink {}", path.display()), err)),
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
        BenchError::io(format!("mkfifo {}", path.display()), io::Error::from(errno))
    })
}

pub fn is_fifo(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

/// Opens the write end without blocking so a reader stuck in `open` returns.
///
/// Fails with `ENXIO` when nobody holds the read end, which callers ignore.
pub fn poke_reader(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

/// Opens the read end without blocking so a writer stuck in `open` returns.
pub fn poke_writer(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn create_replaces_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output");
        fs::write(&path, b"stale").unwrap();
        create(&path).unwrap();
        assert!(is_fifo(&path));
    }

    #[test]
    fn poke_releases_blocked_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output");
        create(&path).unwrap();
        let reader = {
            let path = path.clone();
            thread::spawn(move || File::open(&path).is_ok())
        };
        let mut poked = false;
        for _ in 0..100 {
            if poke_reader(&path).is_ok() {
                poked = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(poked);
        assert!(reader.join().unwrap());
    }
}
