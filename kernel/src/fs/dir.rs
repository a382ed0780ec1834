//! Directories and path resolution.
//!
//! A directory's data is a flat array of fixed-size entries: a 16-bit
//! inode number (0 marks a free slot) and a 14-byte name. Lookup is a
//! linear scan; unlink writes an all-zero tombstone that later links
//! reuse.
//!
//! Path resolution walks one element at a time, holding only the lock of
//! the directory currently being searched. Absolute paths start at the
//! root inode, relative paths at the calling process's current
//! directory.

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::inode::{InodeGuard, InodeRef};
use crate::fs::{FileSystem, InodeType, DIRENT_SIZE, DIRSIZ, ROOT_INO};

/// One directory entry as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl Dirent {
    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&raw[2..DIRENT_SIZE]);
        Self {
            inum: u16::from_le_bytes(raw[..2].try_into().unwrap()),
            name,
        }
    }

    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[..2].copy_from_slice(&self.inum.to_le_bytes());
        out[2..].copy_from_slice(&self.name);
        out
    }

    /// Fixed-width comparison against a sub-DIRSIZ name.
    pub fn name_is(&self, name: &[u8]) -> bool {
        let mut padded = [0u8; DIRSIZ];
        padded[..name.len()].copy_from_slice(name);
        self.name == padded
    }
}

/// A path element held in a fixed-width buffer.
fn pad_name(elem: &[u8]) -> [u8; DIRSIZ] {
    let mut padded = [0u8; DIRSIZ];
    padded[..elem.len()].copy_from_slice(elem);
    padded
}

/// Split the next path element off `path`, skipping separators.
/// Returns `None` when no element remains.
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    if i == path.len() {
        return None;
    }
    let start = i;
    while i < path.len() && path[i] != b'/' {
        i += 1;
    }
    Some((&path[start..i], &path[i..]))
}

impl FileSystem {
    /// Look `name` up in a directory. Returns the entry's inode (with a
    /// new reference) and the byte offset of the entry.
    pub fn dirlookup(
        &self,
        dir: &mut InodeGuard<'_>,
        name: &[u8],
    ) -> KernelResult<Option<(InodeRef, u32)>> {
        assert_eq!(dir.typ, InodeType::Dir, "dirlookup: not a directory");
        let mut raw = [0u8; DIRENT_SIZE];
        let mut off = 0;
        while off < dir.size {
            let n = dir.read(false, raw.as_mut_ptr() as usize, off, DIRENT_SIZE)?;
            if n != DIRENT_SIZE {
                panic!("dirlookup: short directory read");
            }
            let ent = Dirent::decode(&raw);
            if ent.inum != 0 && ent.name_is(name) {
                let iref = self.iget(dir.iref.dev, ent.inum as u32)?;
                return Ok(Some((iref, off)));
            }
            off += DIRENT_SIZE as u32;
        }
        Ok(None)
    }

    /// Add a (name, inum) entry to a directory, reusing the first free
    /// slot or appending past the end.
    pub fn dirlink(&self, dir: &mut InodeGuard<'_>, name: &[u8], inum: u32) -> KernelResult<()> {
        if name.is_empty() || name.len() > DIRSIZ {
            return Err(FsError::NameTooLong.into());
        }
        if let Some((existing, _)) = self.dirlookup(dir, name)? {
            self.iput(existing);
            return Err(FsError::AlreadyExists.into());
        }

        let mut raw = [0u8; DIRENT_SIZE];
        let mut off = 0;
        while off < dir.size {
            dir.read(false, raw.as_mut_ptr() as usize, off, DIRENT_SIZE)?;
            if Dirent::decode(&raw).inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let ent = Dirent {
            inum: inum as u16,
            name: pad_name(name),
        };
        let bytes = ent.encode();
        let n = dir.write(false, bytes.as_ptr() as usize, off, DIRENT_SIZE)?;
        if n != DIRENT_SIZE {
            return Err(FsError::NoFreeBlocks.into());
        }
        Ok(())
    }

    /// Is this directory empty apart from `.` and `..`?
    pub fn dir_is_empty(&self, dir: &mut InodeGuard<'_>) -> KernelResult<bool> {
        let mut raw = [0u8; DIRENT_SIZE];
        let mut off = 2 * DIRENT_SIZE as u32;
        while off < dir.size {
            let n = dir.read(false, raw.as_mut_ptr() as usize, off, DIRENT_SIZE)?;
            if n != DIRENT_SIZE {
                panic!("dir_is_empty: short directory read");
            }
            if Dirent::decode(&raw).inum != 0 {
                return Ok(false);
            }
            off += DIRENT_SIZE as u32;
        }
        Ok(true)
    }

    /// Shared path walk. With `find_parent`, stops one element early and
    /// returns the containing directory plus the final name.
    fn namex(
        &self,
        path: &[u8],
        find_parent: bool,
        cwd: Option<InodeRef>,
    ) -> KernelResult<(InodeRef, [u8; DIRSIZ], usize)> {
        let mut ip = if path.first() == Some(&b'/') {
            self.iget(self.dev, ROOT_INO)?
        } else {
            match cwd {
                Some(c) => self.idup(c),
                None => self.iget(self.dev, ROOT_INO)?,
            }
        };

        let mut rest = path;
        let mut name = [0u8; DIRSIZ];
        let mut name_len = 0;

        while let Some((elem, r)) = skip_elem(rest) {
            rest = r;
            if elem.len() > DIRSIZ {
                self.iput(ip);
                return Err(FsError::NameTooLong.into());
            }
            name = pad_name(elem);
            name_len = elem.len();

            let mut guard = match self.ilock(ip) {
                Ok(g) => g,
                Err(e) => {
                    self.iput(ip);
                    return Err(e);
                }
            };
            if guard.typ != InodeType::Dir {
                drop(guard);
                self.iput(ip);
                return Err(FsError::NotADirectory.into());
            }
            if find_parent && skip_elem(rest).is_none() {
                drop(guard);
                return Ok((ip, name, name_len));
            }
            let next = self.dirlookup(&mut guard, &name[..name_len]);
            drop(guard);
            self.iput(ip);
            match next? {
                Some((n, _)) => ip = n,
                None => return Err(FsError::NotFound.into()),
            }
        }

        if find_parent {
            // A path with no components has no parent to return.
            self.iput(ip);
            return Err(KernelError::InvalidArgument { name: "path" });
        }
        Ok((ip, name, name_len))
    }

    /// Resolve a path to an inode reference.
    pub fn namei(&self, path: &[u8], cwd: Option<InodeRef>) -> KernelResult<InodeRef> {
        self.namex(path, false, cwd).map(|(ip, _, _)| ip)
    }

    /// Resolve to the parent directory of the last path element,
    /// returning the directory and the element's name.
    pub fn nameiparent(
        &self,
        path: &[u8],
        cwd: Option<InodeRef>,
    ) -> KernelResult<(InodeRef, [u8; DIRSIZ], usize)> {
        self.namex(path, true, cwd)
    }

    /// Create a filesystem object at `path`. For regular files, an
    /// existing file or device at the path is returned instead of an
    /// error (open with O_CREATE semantics).
    ///
    /// Caller must hold a log transaction.
    pub fn create(
        &self,
        path: &[u8],
        typ: InodeType,
        major: i16,
        minor: i16,
        cwd: Option<InodeRef>,
    ) -> KernelResult<InodeRef> {
        let (dp, name, name_len) = self.nameiparent(path, cwd)?;
        let mut dguard = match self.ilock(dp) {
            Ok(g) => g,
            Err(e) => {
                self.iput(dp);
                return Err(e);
            }
        };

        if let Some((existing, _)) = self.dirlookup(&mut dguard, &name[..name_len])? {
            drop(dguard);
            self.iput(dp);
            let eguard = match self.ilock(existing) {
                Ok(g) => g,
                Err(e) => {
                    self.iput(existing);
                    return Err(e);
                }
            };
            if typ == InodeType::File
                && (eguard.typ == InodeType::File || eguard.typ == InodeType::Device)
            {
                drop(eguard);
                return Ok(existing);
            }
            drop(eguard);
            self.iput(existing);
            return Err(FsError::AlreadyExists.into());
        }

        let ip = match self.ialloc(typ) {
            Ok(ip) => ip,
            Err(e) => {
                drop(dguard);
                self.iput(dp);
                return Err(e);
            }
        };
        let mut iguard = match self.ilock(ip) {
            Ok(g) => g,
            Err(e) => {
                drop(dguard);
                self.iput(dp);
                self.iput(ip);
                return Err(e);
            }
        };
        iguard.major = major;
        iguard.minor = minor;
        iguard.nlink = 1;
        iguard.update()?;

        let linked = (|| -> KernelResult<()> {
            if typ == InodeType::Dir {
                // `.` and `..` do not count as links on the child (no
                // cyclic counting); the parent gains one below.
                self.dirlink(&mut iguard, b".", ip.inum)?;
                self.dirlink(&mut iguard, b"..", dp.inum)?;
            }
            self.dirlink(&mut dguard, &name[..name_len], ip.inum)?;
            if typ == InodeType::Dir {
                dguard.nlink += 1;
                dguard.update()?;
            }
            Ok(())
        })();

        if let Err(e) = linked {
            // Undo: zero the link count so iput reclaims the inode.
            iguard.nlink = 0;
            iguard.update()?;
            drop(iguard);
            drop(dguard);
            self.iput(ip);
            self.iput(dp);
            return Err(e);
        }

        drop(iguard);
        drop(dguard);
        self.iput(dp);
        Ok(ip)
    }

    /// Remove the directory entry for `path`, dropping the target's link
    /// count. Refuses `.`/`..` and non-empty directories.
    ///
    /// Caller must hold a log transaction.
    pub fn unlink(&self, path: &[u8], cwd: Option<InodeRef>) -> KernelResult<()> {
        let (dp, name, name_len) = self.nameiparent(path, cwd)?;
        let name = &name[..name_len];
        if name == b"." || name == b".." {
            self.iput(dp);
            return Err(KernelError::InvalidArgument { name: "path" });
        }

        let mut dguard = match self.ilock(dp) {
            Ok(g) => g,
            Err(e) => {
                self.iput(dp);
                return Err(e);
            }
        };
        let (ip, off) = match self.dirlookup(&mut dguard, name)? {
            Some(found) => found,
            None => {
                drop(dguard);
                self.iput(dp);
                return Err(FsError::NotFound.into());
            }
        };
        let mut iguard = match self.ilock(ip) {
            Ok(g) => g,
            Err(e) => {
                drop(dguard);
                self.iput(dp);
                self.iput(ip);
                return Err(e);
            }
        };
        if iguard.nlink < 1 {
            panic!("unlink: inode with no links");
        }
        if iguard.typ == InodeType::Dir && !self.dir_is_empty(&mut iguard)? {
            drop(iguard);
            drop(dguard);
            self.iput(dp);
            self.iput(ip);
            return Err(FsError::NotEmpty.into());
        }

        // Tombstone the entry.
        let zero = [0u8; DIRENT_SIZE];
        let n = dguard.write(false, zero.as_ptr() as usize, off, DIRENT_SIZE)?;
        if n != DIRENT_SIZE {
            panic!("unlink: tombstone write failed");
        }
        if iguard.typ == InodeType::Dir {
            dguard.nlink -= 1;
            dguard.update()?;
        }
        drop(dguard);
        self.iput(dp);

        iguard.nlink -= 1;
        iguard.update()?;
        drop(iguard);
        self.iput(ip);
        Ok(())
    }

    /// Create a second directory entry (`new`) for the file at `old`.
    ///
    /// Caller must hold a log transaction.
    pub fn link(&self, old: &[u8], new: &[u8], cwd: Option<InodeRef>) -> KernelResult<()> {
        let ip = self.namei(old, cwd)?;
        let mut iguard = match self.ilock(ip) {
            Ok(g) => g,
            Err(e) => {
                self.iput(ip);
                return Err(e);
            }
        };
        if iguard.typ == InodeType::Dir {
            drop(iguard);
            self.iput(ip);
            return Err(FsError::IsADirectory.into());
        }
        iguard.nlink += 1;
        iguard.update()?;
        drop(iguard);

        let attach = (|| -> KernelResult<()> {
            let (dp, name, name_len) = self.nameiparent(new, cwd)?;
            let mut dguard = match self.ilock(dp) {
                Ok(g) => g,
                Err(e) => {
                    self.iput(dp);
                    return Err(e);
                }
            };
            if dp.dev != ip.dev {
                drop(dguard);
                self.iput(dp);
                return Err(KernelError::InvalidArgument { name: "path" });
            }
            let result = self.dirlink(&mut dguard, &name[..name_len], ip.inum);
            drop(dguard);
            self.iput(dp);
            result
        })();

        if let Err(e) = attach {
            let mut iguard = self.ilock(ip)?;
            iguard.nlink -= 1;
            iguard.update()?;
            drop(iguard);
            self.iput(ip);
            return Err(e);
        }
        self.iput(ip);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn skip_elem_walks_components() {
        let (e, rest) = skip_elem(b"/a/bb/c").expect("element");
        assert_eq!(e, b"a");
        let (e, rest) = skip_elem(rest).expect("element");
        assert_eq!(e, b"bb");
        let (e, rest) = skip_elem(rest).expect("element");
        assert_eq!(e, b"c");
        assert!(skip_elem(rest).is_none());
        assert!(skip_elem(b"///").is_none());
        assert!(skip_elem(b"").is_none());
    }

    #[test]
    fn dirent_round_trips_and_compares_fixed_width() {
        let ent = Dirent {
            inum: 7,
            name: pad_name(b"console"),
        };
        let bytes = ent.encode();
        assert_eq!(Dirent::decode(&bytes), ent);
        assert!(ent.name_is(b"console"));
        assert!(!ent.name_is(b"consol"));
        assert!(!ent.name_is(b"console2"));
    }
}
