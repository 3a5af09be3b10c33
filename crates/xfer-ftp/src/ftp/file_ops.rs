//! File-level operations: download and upload with resume, cooperative
//! pause and cancel.
//!
//! Resume uses `REST` only when the server advertises `REST STREAM`;
//! otherwise the transfer restarts from zero and a warning is published
//! on the transfer handle.

use crate::ftp::client::FtpClient;
use crate::ftp::transfer::DataStream;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use xfer_core::local;
use xfer_core::{TransferHandle, TransferOutcome, XfrError, XfrResult};

impl FtpClient {
    // ─── REST ────────────────────────────────────────────────────

    /// Position the next transfer at `offset`. Returns the offset actually
    /// in effect (0 when resume is unavailable).
    async fn restart_at(&mut self, offset: u64, handle: &TransferHandle) -> XfrResult<u64> {
        if offset == 0 {
            return Ok(0);
        }
        if !self.features.rest_stream {
            handle.warn(format!(
                "Server does not support REST STREAM; restarting from 0 instead of {}",
                offset
            ));
            return Ok(0);
        }
        let resp = self.codec.execute(&format!("REST {}", offset)).await?;
        if resp.is_intermediate() {
            Ok(offset)
        } else {
            handle.warn(format!(
                "REST {} rejected ({}); restarting from 0",
                offset,
                resp.message()
            ));
            Ok(0)
        }
    }

    // ─── DOWNLOAD (RETR) ─────────────────────────────────────────

    /// Download a remote file to a local path starting at `offset`.
    pub async fn download(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        let remote_path = self.absolute(remote_path);

        // Size for progress (best effort).
        let total = if self.features.size {
            self.size(&remote_path).await.ok()
        } else {
            None
        };
        let mut file = local::open_for_write(local_path, offset).await?;

        let start = self.restart_at(offset, handle).await?;
        if start != offset {
            file.set_len(start).await?;
            file.seek(std::io::SeekFrom::Start(start)).await?;
        }

        let (mut ds, outstanding) = self.open_transfer(&format!("RETR {}", remote_path)).await?;
        handle.begin(start, total);

        let io_timeout = self.config.io_timeout;
        let mut done = start;
        let mut buf = vec![0u8; self.config.chunk_size];
        loop {
            if handle.cancel_requested() {
                // The data channel is mid-transfer; the control connection
                // cannot be trusted afterwards.
                self.broken = true;
                return Err(XfrError::cancelled(format!("download of {} cancelled", remote_path)));
            }
            if handle.pause_requested() {
                file.flush().await?;
                drop(ds);
                self.abort().await;
                log::info!("Download of {} paused at {}", remote_path, done);
                return Ok(TransferOutcome::Paused(done));
            }
            let n = match read_chunk(&mut ds, &mut buf, io_timeout).await {
                Ok(n) => n,
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = file.write_all(&buf[..n]).await {
                // The server is still sending; the control channel cannot
                // be trusted afterwards.
                self.broken = true;
                return Err(local_write_error(local_path, e));
            }
            done += n as u64;
            handle.advance(done);
            handle.throttle().await;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        drop(ds);

        self.finish_transfer(outstanding).await?;
        self.info.bytes_downloaded += done - start;
        self.touch();
        handle.finish(done);
        Ok(TransferOutcome::Completed(done))
    }

    // ─── UPLOAD (STOR / APPE) ────────────────────────────────────

    /// Upload a local file to a remote path starting at `offset`.
    pub async fn upload(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        let remote_path = self.absolute(remote_path);
        let total = local::file_size(local_path)?;

        let mut offset = offset;
        if offset > total {
            handle.warn(format!(
                "Resume offset {} is past the end of {} ({} bytes); restarting from 0",
                offset,
                local_path.display(),
                total
            ));
            offset = 0;
        }

        let mut file = local::open_for_read(local_path, 0).await?;
        let (command, start) = self.upload_start(&remote_path, offset, handle).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;

        let (mut ds, outstanding) = self
            .open_transfer(&format!("{} {}", command, remote_path))
            .await?;
        handle.begin(start, Some(total));

        let io_timeout = self.config.io_timeout;
        let mut done = start;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut paused = false;
        loop {
            if handle.cancel_requested() {
                self.broken = true;
                return Err(XfrError::cancelled(format!("upload of {} cancelled", remote_path)));
            }
            if handle.pause_requested() {
                paused = true;
                break;
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Err(e) = write_chunk(&mut ds, &buf[..n], io_timeout).await {
                self.broken = true;
                return Err(e);
            }
            done += n as u64;
            handle.advance(done);
            handle.throttle().await;
        }

        // Closing the data connection tells the server the upload ended;
        // on pause it keeps what arrived so far.
        if let Err(e) = close_stream(&mut ds, io_timeout).await {
            self.broken = true;
            return Err(e);
        }
        drop(ds);
        self.finish_transfer(outstanding).await?;
        self.info.bytes_uploaded += done - start;
        self.touch();

        handle.finish(done);
        if paused {
            log::info!("Upload of {} paused at {}", remote_path, done);
            return Ok(TransferOutcome::Paused(done));
        }
        Ok(TransferOutcome::Completed(done))
    }

    /// Choose the store command and starting offset for an upload.
    ///
    /// `REST`+`STOR` when `REST STREAM` is advertised, `APPE` when the
    /// remote file is exactly `offset` bytes long, otherwise a full `STOR`.
    async fn upload_start(
        &mut self,
        remote_path: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<(&'static str, u64)> {
        if offset == 0 {
            return Ok(("STOR", 0));
        }
        if self.features.rest_stream {
            let start = self.restart_at(offset, handle).await?;
            return Ok(("STOR", start));
        }
        if self.features.size {
            if let Ok(remote_size) = self.size(remote_path).await {
                if remote_size == offset {
                    return Ok(("APPE", offset));
                }
            }
        }
        handle.warn(format!(
            "Server cannot resume uploads; restarting {} from 0 instead of {}",
            remote_path, offset
        ));
        Ok(("STOR", 0))
    }
}

// ─── Chunk helpers ───────────────────────────────────────────────────

fn local_write_error(path: &Path, e: std::io::Error) -> XfrError {
    XfrError::filesystem(format!("write {}: {}", path.display(), e))
}

async fn read_chunk(ds: &mut DataStream, buf: &mut [u8], io_timeout: Duration) -> XfrResult<usize> {
    tokio::time::timeout(io_timeout, ds.read(buf))
        .await
        .map_err(|_| XfrError::timeout("Data channel read timed out"))?
        .map_err(|e| XfrError::transfer(format!("Data channel read: {}", e)))
}

async fn write_chunk(ds: &mut DataStream, buf: &[u8], io_timeout: Duration) -> XfrResult<()> {
    tokio::time::timeout(io_timeout, ds.write_all(buf))
        .await
        .map_err(|_| XfrError::timeout("Data channel write timed out"))?
        .map_err(|e| XfrError::transfer(format!("Data channel write: {}", e)))
}

async fn close_stream(ds: &mut DataStream, io_timeout: Duration) -> XfrResult<()> {
    tokio::time::timeout(io_timeout, async {
        ds.flush().await?;
        ds.shutdown().await
    })
    .await
    .map_err(|_| XfrError::timeout("Data channel close timed out"))?
    .map_err(|e| XfrError::transfer(format!("Data channel close: {}", e)))
}
