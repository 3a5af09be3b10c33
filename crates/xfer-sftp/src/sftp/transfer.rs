// ── Transfer engine – chunked, resumable uploads & downloads ─────────────────
//
// SFTP addresses file contents by offset, so resume is a seek on both ends.
// Pause and cancel are checked between chunks. Cancel matters here because
// the loop runs on a blocking thread that an aborted future cannot stop.

use crate::sftp::service::{map_remote_io, map_ssh_err, SftpConn};
use log::{debug, info};
use ssh2::{OpenFlags, OpenType};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use xfer_core::{local, TransferHandle, TransferOutcome, XfrError, XfrResult};

impl SftpConn {
    // ── Download ─────────────────────────────────────────────────────────────

    pub fn download(
        &self,
        remote: &str,
        local_path: &Path,
        offset: u64,
        chunk_size: usize,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        let total = self
            .sftp
            .stat(Path::new(remote))
            .map_err(|e| map_ssh_err(e, &format!("stat '{}' failed", remote)))?
            .size;

        let start = match total {
            Some(t) if offset > t => {
                handle.warn(format!(
                    "Local copy of {} is longer than the remote file, restarting from 0",
                    remote
                ));
                0
            }
            _ => offset,
        };

        let mut remote_file = self
            .sftp
            .open(Path::new(remote))
            .map_err(|e| map_ssh_err(e, &format!("open '{}' failed", remote)))?;
        if start > 0 {
            remote_file
                .seek(SeekFrom::Start(start))
                .map_err(|e| map_remote_io(e, "seek failed"))?;
        }
        let mut local_file = local::open_for_write_std(local_path, start)?;

        handle.begin(start, total);
        debug!("SFTP RETR {} from offset {}", remote, start);

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut done = start;
        loop {
            if handle.cancel_requested() {
                info!("SFTP download of {} cancelled at {}", remote, done);
                return Err(XfrError::cancelled(format!("download of {} cancelled", remote)));
            }
            if handle.pause_requested() {
                local_file.flush()?;
                handle.finish(done);
                info!("SFTP download of {} paused at {}", remote, done);
                return Ok(TransferOutcome::Paused(done));
            }
            let n = remote_file
                .read(&mut buf)
                .map_err(|e| map_remote_io(e, &format!("read '{}' failed", remote)))?;
            if n == 0 {
                break;
            }
            local_file.write_all(&buf[..n]).map_err(|e| {
                XfrError::filesystem(format!("write {} failed: {}", local_path.display(), e))
            })?;
            done += n as u64;
            handle.advance(done);
            handle.throttle_blocking();
        }

        local_file.flush()?;
        local_file.sync_all()?;
        handle.finish(done);
        Ok(TransferOutcome::Completed(done))
    }

    // ── Upload ───────────────────────────────────────────────────────────────

    pub fn upload(
        &self,
        local_path: &Path,
        remote: &str,
        offset: u64,
        chunk_size: usize,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        let total = local::file_size(local_path)?;
        let mut start = offset;
        if start > total {
            handle.warn(format!(
                "Resume offset {} is past the end of {}, restarting from 0",
                start,
                local_path.display()
            ));
            start = 0;
        }
        if start > 0 {
            let remote_size = self
                .sftp
                .stat(Path::new(remote))
                .ok()
                .and_then(|s| s.size)
                .unwrap_or(0);
            if remote_size < start {
                handle.warn(format!(
                    "Remote {} holds only {} bytes, restarting upload from 0",
                    remote, remote_size
                ));
                start = 0;
            }
        }

        let mut local_file = local::open_for_read_std(local_path, start)?;

        let flags = if start > 0 {
            OpenFlags::WRITE
        } else {
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        };
        let mut remote_file = self
            .sftp
            .open_mode(Path::new(remote), flags, 0o644, OpenType::File)
            .map_err(|e| map_ssh_err(e, &format!("open '{}' for write failed", remote)))?;
        if start > 0 {
            remote_file
                .seek(SeekFrom::Start(start))
                .map_err(|e| map_remote_io(e, "seek failed"))?;
        }

        handle.begin(start, Some(total));
        debug!("SFTP STOR {} from offset {}", remote, start);

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut done = start;
        let mut paused = false;
        loop {
            if handle.cancel_requested() {
                info!("SFTP upload of {} cancelled at {}", remote, done);
                return Err(XfrError::cancelled(format!("upload of {} cancelled", remote)));
            }
            if handle.pause_requested() {
                paused = true;
                break;
            }
            let n = local_file.read(&mut buf).map_err(|e| {
                XfrError::filesystem(format!("read {} failed: {}", local_path.display(), e))
            })?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buf[..n])
                .map_err(|e| map_remote_io(e, &format!("write '{}' failed", remote)))?;
            done += n as u64;
            handle.advance(done);
            handle.throttle_blocking();
        }

        remote_file
            .flush()
            .map_err(|e| map_remote_io(e, &format!("flush '{}' failed", remote)))?;
        handle.finish(done);
        if paused {
            info!("SFTP upload of {} paused at {}", remote, done);
            Ok(TransferOutcome::Paused(done))
        } else {
            Ok(TransferOutcome::Completed(done))
        }
    }
}
