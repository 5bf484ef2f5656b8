//! Rolling on-disk store for active session data.
//!
//! Disabled unless [`crate::config::EngineConfig::active_session_data_on_disk_new_file_duration`]
//! is set. When enabled, the engine periodically opens a new append-only
//! file in the configured directory; each active session remembers which
//! file and byte range it owns. A file is deleted once every session that
//! wrote into it has closed.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{error, warn};

use crate::segment::SessionId;

struct RollingFile {
	id: u64,
	path: PathBuf,
	file: File,
	len: u64,
	sessions_using: usize,
}

/// A session's byte range within whichever file it was written to.
#[derive(Clone, Copy, Debug)]
struct SessionRange {
	file_id: u64,
	offset: u64,
	len: u64,
}

/// Append-only rolling store for session data.
pub struct SessionStore {
	directory: PathBuf,
	next_file_id: u64,
	current: RollingFile,
	files: HashMap<u64, RollingFile>,
	sessions: HashMap<SessionId, SessionRange>,
}

impl SessionStore {
	pub fn open(directory: &Path) -> io::Result<Self> {
		fs::create_dir_all(directory)?;

		let mut store =
			Self { directory: directory.to_path_buf(), next_file_id: 0, current: Self::open_file(directory, 0)?, files: HashMap::new(), sessions: HashMap::new() };

		store.next_file_id = 1;
		Ok(store)
	}

	fn open_file(directory: &Path, id: u64) -> io::Result<RollingFile> {
		let path = directory.join(format!("ltp-session-{id}.dat"));
		let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
		Ok(RollingFile { id, path, file, len: 0, sessions_using: 0 })
	}

	/// Rolls to a fresh file. Called by the engine on its configured interval.
	pub fn roll(&mut self) -> io::Result<()> {
		let next = Self::open_file(&self.directory, self.next_file_id)?;
		self.next_file_id += 1;

		let retiring = std::mem::replace(&mut self.current, next);

		if retiring.sessions_using == 0 {
			if let Err(err) = fs::remove_file(&retiring.path) {
				warn!("Failed to delete unused LTP session store file {:?}: {err}", retiring.path);
			}
		} else {
			self.files.insert(retiring.id, retiring);
		}

		Ok(())
	}

	/// Writes `data` as `session`'s block, appending to the currently open file.
	pub fn write_block(&mut self, session: SessionId, data: &[u8]) -> io::Result<()> {
		let offset = self.current.len;
		self.current.file.write_all(data)?;
		self.current.len += data.len() as u64;
		self.current.sessions_using += 1;

		self.sessions.insert(session, SessionRange { file_id: self.current.id, offset, len: data.len() as u64 });

		Ok(())
	}

	/// Reads back the bytes `session` wrote, for handing to `red_part_reception`.
	pub fn read_block(&mut self, session: SessionId) -> io::Result<Vec<u8>> {
		let range = self.sessions.get(&session).copied().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown session"))?;

		let file = if range.file_id == self.current.id { &mut self.current.file } else { &mut self.files.get_mut(&range.file_id).expect("tracked file still open").file };

		let mut buf = vec![0u8; range.len as usize];
		file.seek(SeekFrom::Start(range.offset))?;
		file.read_exact(&mut buf)?;

		Ok(buf)
	}

	/// Releases `session`'s range. Deletes its file if this was the last user.
	pub fn close_session(&mut self, session: SessionId) {
		let Some(range) = self.sessions.remove(&session) else { return };

		if range.file_id == self.current.id {
			self.current.sessions_using -= 1;
			return;
		}

		let Some(file) = self.files.get_mut(&range.file_id) else { return };
		file.sessions_using -= 1;

		if file.sessions_using == 0 {
			let retiring = self.files.remove(&range.file_id).expect("just looked up");
			if let Err(err) = fs::remove_file(&retiring.path) {
				error!("Failed to delete drained LTP session store file {:?}: {err}", retiring.path);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn session(n: u64) -> SessionId {
		SessionId { originator_engine_id: 1, session_number: n }
	}

	#[test]
	fn writes_and_reads_back_a_block() {
		let dir = std::env::temp_dir().join(format!("ltp-store-test-{}", std::process::id()));
		let mut store = SessionStore::open(&dir).unwrap();

		store.write_block(session(1), b"hello world").unwrap();
		assert_eq!(store.read_block(session(1)).unwrap(), b"hello world");

		store.close_session(session(1));
		fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn file_is_deleted_once_every_session_using_it_closes() {
		let dir = std::env::temp_dir().join(format!("ltp-store-test-roll-{}", std::process::id()));
		let mut store = SessionStore::open(&dir).unwrap();

		store.write_block(session(1), b"a").unwrap();
		store.write_block(session(2), b"b").unwrap();

		store.roll().unwrap();
		assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

		store.close_session(session(1));
		assert_eq!(fs::read_dir(&dir).unwrap().count(), 2, "file still has one session using it");

		store.close_session(session(2));
		assert_eq!(fs::read_dir(&dir).unwrap().count(), 1, "drained old file should be deleted");

		fs::remove_dir_all(&dir).ok();
	}
}
