//! The leech workdir layout, represented as a type hierarchy.
//!
//! Every location inside a workdir is wrapped in its own newtype, so that
//! functions can demand "the blocks directory" or "a head file" instead of a
//! bare [`Path`]. The layout is:
//!
//! ```text
//! workdir/
//!   leech.json            configuration
//!   blocks/<fp>           one file per block, named by its fingerprint
//!   heads/<table-id>      current head fingerprint, one file per table
//!   peers/<host-id>       last-received head fingerprints, one file per host
//!   .lock                 single-writer lock file
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

macro_rules! path_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(PathBuf);

        impl $name {
            /// Wrap `path` without checking that anything exists there.
            pub fn from_path_unchecked(path: impl Into<PathBuf>) -> Self {
                Self(path.into())
            }

            /// View as a plain [`Path`].
            pub fn as_path(&self) -> &Path {
                &self.0
            }

            /// See [`Path::display`].
            pub fn display(&self) -> std::path::Display<'_> {
                self.0.display()
            }
        }

        impl AsRef<Path> for $name {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }

        impl From<$name> for PathBuf {
            fn from(p: $name) -> PathBuf {
                p.0
            }
        }
    };
}

macro_rules! dir_type {
    ($(#[$attr:meta])* $name:ident) => {
        path_type!($(#[$attr])* $name);

        impl $name {
            /// Create this directory (and any missing parents).
            pub fn create(&self) -> io::Result<()> {
                fs::create_dir_all(&self.0)
            }
        }
    };
}

dir_type! {
    /// The root of a leech workdir.
    Workdir
}

dir_type! {
    /// `workdir/blocks`, the content-addressed block files.
    BlocksDir
}

dir_type! {
    /// `workdir/heads`, one head pointer file per table.
    HeadsDir
}

dir_type! {
    /// `workdir/peers`, one pointer file per known host.
    PeersDir
}

path_type! {
    /// `workdir/leech.json`.
    ConfigFile
}

path_type! {
    /// A single block file, named by the block's fingerprint.
    BlockFile
}

path_type! {
    /// The head pointer file of one table.
    HeadFile
}

path_type! {
    /// The peer pointer file of one host.
    PeerFile
}

path_type! {
    /// `workdir/.lock`, the single-writer lock file.
    LockFile
}

impl Workdir {
    /// The configuration file `leech.json` at the workdir root.
    pub fn config_file(&self) -> ConfigFile {
        ConfigFile(self.0.join("leech.json"))
    }

    /// The `blocks` directory.
    pub fn blocks(&self) -> BlocksDir {
        BlocksDir(self.0.join("blocks"))
    }

    /// The `heads` directory.
    pub fn heads(&self) -> HeadsDir {
        HeadsDir(self.0.join("heads"))
    }

    /// The `peers` directory.
    pub fn peers(&self) -> PeersDir {
        PeersDir(self.0.join("peers"))
    }

    /// The lock file gating mutation of this workdir.
    pub fn lock_file(&self) -> LockFile {
        LockFile(self.0.join(".lock"))
    }
}

impl BlocksDir {
    /// The file holding the block identified by `fp`.
    ///
    /// `fp` is rendered with its `Display` impl, which for fingerprints is
    /// the 40-character lowercase hex form.
    pub fn block(&self, fp: impl fmt::Display) -> BlockFile {
        BlockFile(self.0.join(fp.to_string()))
    }
}

impl HeadsDir {
    /// The head pointer file for `table_id`.
    pub fn head(&self, table_id: impl fmt::Display) -> HeadFile {
        HeadFile(self.0.join(table_id.to_string()))
    }
}

impl PeersDir {
    /// The peer pointer file for `host_id`.
    pub fn peer(&self, host_id: &str) -> PeerFile {
        PeerFile(self.0.join(host_id))
    }
}
