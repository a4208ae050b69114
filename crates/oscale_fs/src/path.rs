//! Path name resolution.

use oscale_fs_types::DIRSIZ;

use crate::{
    error::FsError,
    fs::FileSystem,
    inode::{InodeRef, InodeType, directory},
};

/// Splits the next path element off `path`.
///
/// Leading slashes are consumed; the returned remainder has none either, so
/// an empty remainder means the element was the last one. A component longer
/// than `DIRSIZ` fails with [`FsError::NameTooLong`].
///
/// ```text
/// skip_elem(b"a/bb/c")  == Some((b"a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some((b"a", b"bb"))
/// skip_elem(b"a")       == Some((b"a", b""))
/// skip_elem(b"")        == None
/// skip_elem(b"///")     == None
/// ```
fn skip_elem(path: &[u8]) -> Result<Option<(&[u8], &[u8])>, FsError> {
    let Some(start) = path.iter().position(|&c| c != b'/') else {
        return Ok(None);
    };
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let elem = &path[..end];
    if elem.len() > DIRSIZ {
        return Err(FsError::NameTooLong);
    }
    let rest = &path[end..];
    let next = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    Ok(Some((elem, &rest[next..])))
}

impl FileSystem {
    /// Resolves `path` to an inode. Absolute paths start at the root;
    /// relative paths start at `cwd`.
    pub fn namei(&self, cwd: &InodeRef, path: &[u8]) -> Result<InodeRef, FsError> {
        self.namex(cwd, path, false, &mut [0; DIRSIZ])
            .map(|(ip, _)| ip)
    }

    /// Resolves `path` to the inode of its *parent* directory, writing the
    /// final path element into `name`.
    pub fn nameiparent<'n>(
        &self,
        cwd: &InodeRef,
        path: &[u8],
        name: &'n mut [u8; DIRSIZ],
    ) -> Result<(InodeRef, &'n [u8]), FsError> {
        let (ip, len) = self.namex(cwd, path, true, name)?;
        Ok((ip, &name[..len]))
    }

    fn namex(
        &self,
        cwd: &InodeRef,
        path: &[u8],
        wantparent: bool,
        name_out: &mut [u8; DIRSIZ],
    ) -> Result<(InodeRef, usize), FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidPath);
        }

        let core = self.core();
        let _epoch = core.gc.pin();

        let mut ip = if path[0] == b'/' {
            self.root()
        } else {
            cwd.clone()
        };

        let mut rest = path;
        while let Some((elem, r)) = skip_elem(rest)? {
            rest = r;
            name_out[..elem.len()].copy_from_slice(elem);
            name_out[elem.len()..].fill(0);

            assert!(
                ip.ty() != InodeType::Free,
                "namex: free inode {} on the path",
                ip.inum()
            );
            if ip.ty() != InodeType::Dir {
                return Err(FsError::NotADirectory);
            }
            if wantparent && rest.is_empty() {
                // Stop one level early.
                return Ok((ip, elem.len()));
            }

            let Some(next) = directory::dirlookup(core, &ip, elem)? else {
                return Err(FsError::NotFound);
            };
            ip = next;
        }

        if wantparent {
            // The path had no final component to split off.
            return Err(FsError::InvalidPath);
        }
        Ok((ip, 0))
    }
}

#[cfg(test)]
mod tests {
    use oscale_fs_types::InodeNo;

    use super::*;
    use crate::{DeviceNo, LockMode, inode::tests::fresh_fs};

    #[test]
    fn skip_elem_lexing() {
        assert_eq!(skip_elem(b"a/bb/c").unwrap(), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_elem(b"///a//bb").unwrap(), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_elem(b"a").unwrap(), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b"a/").unwrap(), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b"").unwrap(), None);
        assert_eq!(skip_elem(b"///").unwrap(), None);
    }

    #[test]
    fn component_length_boundary() {
        let exact = [b'e'; DIRSIZ];
        assert!(skip_elem(&exact).unwrap().is_some());

        let long = [b'l'; DIRSIZ + 1];
        assert!(matches!(skip_elem(&long), Err(FsError::NameTooLong)));
    }

    fn link_file(fs: &crate::FileSystem, dp: &InodeRef, name: &[u8]) -> InodeNo {
        let ip = fs.ialloc(DeviceNo::ROOT, InodeType::File).unwrap();
        ip.iunlock();
        dp.ilock(LockMode::Write);
        let tx = fs.begin_transaction();
        fs.dirlink(dp, name, ip.inum(), false, &tx).unwrap();
        fs.commit_transaction(tx).unwrap();
        fs.flush_journal().unwrap();
        dp.iunlock();
        ip.inum()
    }

    #[test]
    fn resolve_root_and_empty() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();

        let ip = fs.namei(&root, b"/").unwrap();
        assert_eq!(ip.inum(), InodeNo::ROOT);

        assert!(matches!(fs.namei(&root, b""), Err(FsError::InvalidPath)));
    }

    #[test]
    fn resolve_file_and_missing() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let inum = link_file(&fs, &root, b"hello.txt");

        let ip = fs.namei(&root, b"/hello.txt").unwrap();
        assert_eq!(ip.inum(), inum);

        // Relative resolution from the root as cwd.
        let ip = fs.namei(&root, b"hello.txt").unwrap();
        assert_eq!(ip.inum(), inum);

        assert!(matches!(
            fs.namei(&root, b"/nope"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn file_component_mid_path_fails() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        link_file(&fs, &root, b"plain");

        assert!(matches!(
            fs.namei(&root, b"/plain/child"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn parent_resolution() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        link_file(&fs, &root, b"leaf");

        let mut name = [0; DIRSIZ];
        let (dp, last) = fs.nameiparent(&root, b"/leaf", &mut name).unwrap();
        assert_eq!(dp.inum(), InodeNo::ROOT);
        assert_eq!(last, b"leaf");

        // "/" has no final component to name.
        let mut name = [0; DIRSIZ];
        assert!(matches!(
            fs.nameiparent(&root, b"/", &mut name),
            Err(FsError::InvalidPath)
        ));
    }

    #[test]
    fn name_too_long_component() {
        let (_device, fs) = fresh_fs();
        let root = fs.root();
        let mut path = vec![b'/'];
        path.extend([b'x'; DIRSIZ + 1]);
        assert!(matches!(
            fs.namei(&root, &path),
            Err(FsError::NameTooLong)
        ));
    }
}
