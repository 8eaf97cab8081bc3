//! Descriptor dispatch
//!
//! Descriptors in the archive's reserved range go to the archive, all
//! others to the host. No path classification is involved.

use crate::backend::FileStat;
use crate::error::{Result, RouterError};
use crate::router::Router;
use std::io::{IoSliceMut, SeekFrom};
use std::os::unix::io::RawFd;
use tracing::trace;

impl Router {
    fn is_virtual_fd(&self, fd: RawFd) -> bool {
        let owned = self.archive.is_descriptor(fd);
        trace!(fd, virtual_fd = owned, "dispatching descriptor");
        owned
    }

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        if self.is_virtual_fd(fd) {
            self.archive.read(fd, buf)
        } else {
            Ok(self.host.read(fd, buf)?)
        }
    }

    pub fn lseek(&self, fd: RawFd, pos: SeekFrom) -> Result<u64> {
        if self.is_virtual_fd(fd) {
            self.archive.seek(fd, pos)
        } else {
            Ok(self.host.seek(fd, pos)?)
        }
    }

    /// Read at `offset` without moving the descriptor's position
    ///
    /// For virtual descriptors this is a seek, read and seek back, so it is
    /// not atomic against other users of the same descriptor.
    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.is_virtual_fd(fd) {
            return Ok(self.host.pread(fd, buf, offset)?);
        }

        let saved = self.archive.seek(fd, SeekFrom::Current(0))?;
        self.archive.seek(fd, SeekFrom::Start(offset))?;
        let read = self.archive.read(fd, buf);
        let restored = self.archive.seek(fd, SeekFrom::Start(saved))?;
        debug_assert_eq!(restored, saved);
        read
    }

    /// Scatter read
    ///
    /// Virtual descriptors fill the buffers in order until a read returns
    /// nothing. Any failure fails the whole call.
    pub fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        if !self.is_virtual_fd(fd) {
            return Ok(self.host.readv(fd, bufs)?);
        }

        let mut total = 0usize;
        for buf in bufs.iter_mut() {
            if buf.is_empty() {
                continue;
            }
            let count = self.archive.read(fd, buf)?;
            total = total
                .checked_add(count)
                .ok_or_else(|| RouterError::InvalidArgument("readv total overflows".to_string()))?;
            if count == 0 {
                break;
            }
        }
        Ok(total)
    }

    pub fn fstat(&self, fd: RawFd) -> Result<FileStat> {
        if self.is_virtual_fd(fd) {
            self.archive.fstat(fd)
        } else {
            Ok(self.host.fstat(fd)?)
        }
    }

    pub fn close(&self, fd: RawFd) -> Result<()> {
        if self.is_virtual_fd(fd) {
            self.archive.close(fd)
        } else {
            Ok(self.host.close(fd)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::OpenOptions;
    use crate::config::RouterConfig;
    use crate::error::{Result, RouterError};
    use crate::image::{ImageWriter, VFD_BASE};
    use crate::router::Router;
    use std::io::{IoSliceMut, SeekFrom};
    use tempfile::{NamedTempFile, TempDir};

    fn router(contents: &[u8]) -> Result<(TempDir, NamedTempFile, Router)> {
        let scratch = TempDir::new()?;
        let image = NamedTempFile::new()?;
        {
            let mut writer = ImageWriter::create(image.path())?;
            writer.add_file("data.bin", contents)?;
            writer.finalize()?;
        }
        let config = RouterConfig::default()
            .with_mount_marker("/__scope__")
            .with_temp_root(scratch.path());
        let router = Router::with_image(config, image.path())?;
        Ok((scratch, image, router))
    }

    #[test]
    fn test_pread_keeps_position() -> Result<()> {
        let (_scratch, _image, router) = router(b"0123456789")?;
        let fd = router.open("/__scope__/data.bin", &OpenOptions::read_only())?;
        assert!(fd >= VFD_BASE);

        let mut head = [0u8; 2];
        router.read(fd, &mut head)?;
        assert_eq!(&head, b"01");

        let mut middle = [0u8; 3];
        assert_eq!(router.pread(fd, &mut middle, 6)?, 3);
        assert_eq!(&middle, b"678");

        let mut next = [0u8; 2];
        router.read(fd, &mut next)?;
        assert_eq!(&next, b"23");
        assert_eq!(router.lseek(fd, SeekFrom::Current(0))?, 4);

        // Past the end reads nothing and still restores the position
        assert_eq!(router.pread(fd, &mut middle, 100)?, 0);
        assert_eq!(router.lseek(fd, SeekFrom::Current(0))?, 4);
        router.close(fd)
    }

    #[test]
    fn test_readv_stops_mid_second_buffer() -> Result<()> {
        let (_scratch, _image, router) = router(b"abcdefg")?;
        let fd = router.open("/__scope__/data.bin", &OpenOptions::read_only())?;

        let mut first = [0u8; 4];
        let mut second = [0u8; 6];
        let mut third = [0xAAu8; 4];
        let total = {
            let mut bufs = [
                IoSliceMut::new(&mut first),
                IoSliceMut::new(&mut second),
                IoSliceMut::new(&mut third),
            ];
            router.readv(fd, &mut bufs)?
        };

        assert_eq!(total, 7);
        assert_eq!(&first, b"abcd");
        assert_eq!(&second[..3], b"efg");
        assert_eq!(third, [0xAA; 4]);
        router.close(fd)
    }

    #[test]
    fn test_closed_descriptor_is_bad() -> Result<()> {
        let (_scratch, _image, router) = router(b"x")?;
        let fd = router.open("/__scope__/data.bin", &OpenOptions::read_only())?;
        assert_eq!(router.fstat(fd)?.size, 1);
        router.close(fd)?;

        let err = router.read(fd, &mut [0u8; 1]).unwrap_err();
        assert!(matches!(err, RouterError::BadDescriptor(_)));
        assert_eq!(err.errno(), libc::EBADF);
        assert!(router.fstat(fd).is_err());
        Ok(())
    }

    #[test]
    fn test_host_descriptors_pass_through() -> Result<()> {
        let (scratch, _image, router) = router(b"")?;
        let path = scratch.path().join("real.txt");
        std::fs::write(&path, b"real data")?;

        let fd = router.open(path.to_str().unwrap(), &OpenOptions::read_only())?;
        assert!(fd < VFD_BASE);

        let mut buf = [0u8; 4];
        assert_eq!(router.pread(fd, &mut buf, 5)?, 4);
        assert_eq!(&buf, b"data");
        assert_eq!(router.lseek(fd, SeekFrom::Current(0))?, 0);
        assert_eq!(router.fstat(fd)?.size, 9);
        router.close(fd)
    }
}
