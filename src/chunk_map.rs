// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Chunk mapper: reserves a contiguous virtual region for the whole NVM
// space up front (PROT_NONE, no backing), then backs it chunk by chunk as
// the allocator grows. Recovery remaps whatever the workspace already
// holds at the same slots, so all relative offsets stay valid.
//
// Backing store is selected at build time:
//   backing-file — one growable <workspace>/backing file
//   backing-dir  — one file per chunk, <workspace>/mapNNNNNNNNN

#[cfg(all(feature = "backing-file", feature = "backing-dir"))]
compile_error!("features `backing-file` and `backing-dir` are mutually exclusive");

#[cfg(not(any(feature = "backing-file", feature = "backing-dir")))]
compile_error!("enable exactly one of the `backing-file` / `backing-dir` features");

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Error;
use crate::layout::CHUNK_SIZE;

pub(crate) struct ChunkMap {
    base: *mut u8,
    max_chunks: u64,
    workspace: PathBuf,
    state: Mutex<MapState>,
}

struct MapState {
    next_unmapped: u64,
    #[cfg(feature = "backing-file")]
    backing: Option<File>,
}

// Safety: the mapped region is shared by design; all mutation of the map
// state goes through the mutex.
unsafe impl Send for ChunkMap {}
unsafe impl Sync for ChunkMap {}

impl ChunkMap {
    /// Reserve `max_chunks * CHUNK_SIZE` of address space with no backing.
    /// When `fresh` is set, any backing store left in the workspace is
    /// removed first.
    pub(crate) fn init(workspace: &Path, max_chunks: u64, fresh: bool) -> Result<Self, Error> {
        let len = max_chunks as usize * CHUNK_SIZE;
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        let map = Self {
            base: mem as *mut u8,
            max_chunks,
            workspace: workspace.to_path_buf(),
            state: Mutex::new(MapState {
                next_unmapped: 0,
                #[cfg(feature = "backing-file")]
                backing: None,
            }),
        };
        if fresh {
            map.wipe_backing()?;
        }
        Ok(map)
    }

    /// Start of the reserved region.
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    /// Remap any chunks previously backed by the workspace and return how
    /// many are live.
    pub(crate) fn recover(&self) -> Result<u64, Error> {
        let mut st = self.state.lock();

        #[cfg(feature = "backing-file")]
        let n = {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.workspace.join("backing"))
            {
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
                Ok(file) => {
                    let n = file.metadata()?.len() / CHUNK_SIZE as u64;
                    if n > self.max_chunks {
                        return Err(Error::Corrupt(format!(
                            "backing store holds {n} chunks, region reserves {}",
                            self.max_chunks
                        )));
                    }
                    if n > 0 {
                        self.map_fixed(file.as_raw_fd(), 0, n, 0)?;
                    }
                    st.backing = Some(file);
                    n
                }
            }
        };

        #[cfg(feature = "backing-dir")]
        let n = {
            let mut idx = 0u64;
            loop {
                if idx == self.max_chunks {
                    break;
                }
                let file = match OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(self.chunk_path(idx))
                {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                    Err(e) => return Err(e.into()),
                    Ok(f) => f,
                };
                self.map_fixed(file.as_raw_fd(), idx, 1, 0)?;
                idx += 1;
            }
            idx
        };

        st.next_unmapped = n;
        debug!(chunks = n, "remapped persistent chunks");
        Ok(n)
    }

    /// Extend the backing store by `n` chunks, map them read/write at the
    /// next free slots and return the address of the first new chunk.
    pub(crate) fn activate_more(&self, n: u64) -> Result<*mut u8, Error> {
        let mut st = self.state.lock();
        let first = st.next_unmapped;
        if first + n > self.max_chunks {
            return Err(Error::Exhausted);
        }

        #[cfg(feature = "backing-file")]
        {
            if st.backing.is_none() {
                st.backing = Some(
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .open(self.workspace.join("backing"))?,
                );
            }
            let file = st.backing.as_ref().unwrap();
            ensure_len(file, (first + n) * CHUNK_SIZE as u64)?;
            self.map_fixed(file.as_raw_fd(), first, n, first * CHUNK_SIZE as u64)?;
        }

        #[cfg(feature = "backing-dir")]
        {
            for i in 0..n {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(self.chunk_path(first + i))?;
                ensure_len(&file, CHUNK_SIZE as u64)?;
                self.map_fixed(file.as_raw_fd(), first + i, 1, 0)?;
            }
        }

        st.next_unmapped = first + n;
        debug!(first, n, "activated chunks");
        Ok(unsafe { self.base.add(first as usize * CHUNK_SIZE) })
    }

    fn map_fixed(&self, fd: i32, chunk_idx: u64, n_chunks: u64, offset: u64) -> Result<(), Error> {
        let addr = unsafe { self.base.add(chunk_idx as usize * CHUNK_SIZE) };
        let mem = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                n_chunks as usize * CHUNK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_NORESERVE | libc::MAP_FIXED,
                fd,
                offset as libc::off_t,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn wipe_backing(&self) -> Result<(), Error> {
        #[cfg(feature = "backing-file")]
        {
            match std::fs::remove_file(self.workspace.join("backing")) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        #[cfg(feature = "backing-dir")]
        {
            let mut idx = 0u64;
            loop {
                match std::fs::remove_file(self.chunk_path(idx)) {
                    Ok(()) => idx += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    #[cfg(feature = "backing-dir")]
    fn chunk_path(&self, idx: u64) -> PathBuf {
        self.workspace.join(format!("map{idx:09}"))
    }
}

impl Drop for ChunkMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.base as *mut libc::c_void,
                self.max_chunks as usize * CHUNK_SIZE,
            );
        }
    }
}

#[cfg(target_os = "linux")]
fn ensure_len(file: &File, len: u64) -> Result<(), Error> {
    // posix_fallocate actually reserves the blocks, so a later flush never
    // dies on a full disk.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc).into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ensure_len(file: &File, len: u64) -> Result<(), Error> {
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(())
}
