//! Background decoding.
//!
//! Decoding touches only CPU memory, so it can run on a worker thread. The
//! decoded [`PtmFile`] comes back over a channel and is then handed to the
//! renderer on the thread that owns the GPU device.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};

use crate::ptm::{self, PtmFile};

pub struct PtmLoader {
    path: PathBuf,
    receiver: mpsc::Receiver<Result<PtmFile>>,
    worker: Option<JoinHandle<()>>,
}

impl PtmLoader {
    pub fn spawn(path: &Path) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Result<PtmFile>>(1);
        let worker_path = path.to_path_buf();

        let worker = thread::Builder::new()
            .name("ptm-decoder".to_owned())
            .spawn(move || {
                let result = ptm::read_file(&worker_path);
                // The receiver may have been dropped by a newer load.
                let _ = sender.send(result);
            })
            .context("failed to spawn PTM decoder thread")?;

        log::debug!("decoding {} in background", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            receiver,
            worker: Some(worker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the result if decoding has finished, without blocking.
    pub fn try_take(&mut self) -> Option<Result<PtmFile>> {
        match self.receiver.try_recv() {
            Ok(result) => {
                self.join_worker();
                Some(result)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                Some(Err(self.disconnected_error()))
            }
        }
    }

    /// Blocks until decoding finishes.
    pub fn wait(mut self) -> Result<PtmFile> {
        match self.receiver.recv() {
            Ok(result) => {
                self.join_worker();
                result
            }
            Err(_) => Err(self.disconnected_error()),
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn disconnected_error(&mut self) -> anyhow::Error {
        let panicked = self
            .worker
            .take()
            .map_or(false, |handle| handle.join().is_err());
        if panicked {
            anyhow!("PTM decoder thread panicked while reading {}", self.path.display())
        } else {
            anyhow!("PTM decoder thread exited without a result for {}", self.path.display())
        }
    }
}
