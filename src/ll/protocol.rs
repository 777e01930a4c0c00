//! Filesystem protocol messages.
//!
//! The client and the server exchange fixed 64-byte records through the two
//! rings in [`crate::ll::queue`]. A command carries an opaque id, a command
//! type and a 48-byte parameter pane; its completion echoes the id and
//! carries a status word plus a 48-byte result pane. The panes are unions
//! on the wire; here they are raw byte arrays with typed `zerocopy` views,
//! so a malformed pane can never be misread as anything but bytes.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Capacity of the command and completion rings, in messages.
pub const FS_QUEUE_CAPACITY: u64 = 511;

/// Longest directory-entry name the protocol can carry.
pub const FS_MAX_NAME_LENGTH: u64 = 255;

/// Longest path accepted in a command.
pub const FS_MAX_PATH_LENGTH: u64 = 4095;

/// Number of defined command types. Anything at or above this value is
/// consumed without a completion.
pub const FS_NUM_COMMANDS: u64 = 20;

const PANE_SIZE: usize = 48;

/// Command types, in wire order. The first two are the mount/unmount pair
/// under their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum CmdType {
    Initialise,
    Deinitialise,
    FileOpen,
    FileClose,
    Stat,
    FileRead,
    FileWrite,
    FileSize,
    Rename,
    FileRemove,
    FileTruncate,
    DirCreate,
    DirRemove,
    DirOpen,
    DirClose,
    FileSync,
    DirRead,
    DirSeek,
    DirTell,
    DirRewind,
}

/// Completion status codes produced by the server itself.
///
/// Back-end failures that have no entry here round-trip the FAT driver's
/// numeric code instead (see `FatError::wire_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u64)]
pub enum Status {
    Success = 0,
    Error = 1,
    InvalidBuffer = 2,
    InvalidPath = 3,
    InvalidFd = 4,
    AllocationError = 5,
    OutstandingOperations = 6,
    InvalidName = 7,
    TooManyOpenFiles = 8,
    ServerDenied = 9,
    InvalidWrite = 10,
    InvalidRead = 11,
    DirectoryFull = 12,
    InvalidCommand = 13,
    EndOfDirectory = 14,
}

/// A half-open `[offset, offset + size)` range inside the client data
/// region.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FsBuffer {
    pub offset: u64,
    pub size: u64,
}

/// Open flags: the low two bits select the access mode, bit 2 requests
/// open-or-create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u64);

impl OpenFlags {
    pub const READ_ONLY: u64 = 0;
    pub const WRITE_ONLY: u64 = 1;
    pub const READ_WRITE: u64 = 2;
    pub const CREATE: u64 = 4;

    /// Whether reads are permitted. Mode 3 (both low bits set) grants
    /// neither direction, matching the source protocol's translation.
    pub fn readable(self) -> bool {
        self.0 & 0x3 == Self::READ_ONLY || self.0 & 0x3 == Self::READ_WRITE
    }

    /// Whether writes are permitted.
    pub fn writable(self) -> bool {
        self.0 & 0x3 == Self::WRITE_ONLY || self.0 & 0x3 == Self::READ_WRITE
    }

    /// Whether the file should be created when absent.
    pub fn create(self) -> bool {
        self.0 & Self::CREATE != 0
    }
}

// Parameter records. Each is a typed view of the command pane; commands
// that carry only a descriptor share `FdParams`.

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OpenParams {
    pub path: FsBuffer,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FdParams {
    pub fd: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct StatParams {
    pub path: FsBuffer,
    pub buf: FsBuffer,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RwParams {
    pub fd: u64,
    pub offset: u64,
    pub buf: FsBuffer,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RenameParams {
    pub old_path: FsBuffer,
    pub new_path: FsBuffer,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PathParams {
    pub path: FsBuffer,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TruncateParams {
    pub fd: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirReadParams {
    pub fd: u64,
    pub buf: FsBuffer,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirSeekParams {
    pub fd: u64,
    pub loc: i64,
}

// Result records.

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OpenResult {
    pub fd: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ReadResult {
    pub len_read: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WriteResult {
    pub len_written: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SizeResult {
    pub size: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirReadResult {
    pub path_len: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirTellResult {
    pub location: u64,
}

/// The stat record written into the client's buffer by `Stat`.
///
/// Fields the FAT back-end cannot populate stay zero.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FsStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u64,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atime_nsec: u64,
    pub mtime_nsec: u64,
    pub ctime_nsec: u64,
    pub used: u64,
}

/// The 48-byte command parameter pane.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CmdParams(pub [u8; PANE_SIZE]);

impl CmdParams {
    pub fn zeroed() -> CmdParams {
        CmdParams([0; PANE_SIZE])
    }

    /// Build a pane from a typed parameter record.
    pub fn of<P: IntoBytes + Immutable>(params: P) -> CmdParams {
        const { assert!(size_of::<P>() <= PANE_SIZE) }
        let mut pane = [0; PANE_SIZE];
        pane[..size_of::<P>()].copy_from_slice(params.as_bytes());
        CmdParams(pane)
    }

    /// Read a typed parameter record out of the pane.
    pub fn get<P: FromBytes>(&self) -> P {
        const { assert!(size_of::<P>() <= PANE_SIZE) }
        let (params, _) = P::read_from_prefix(&self.0).expect("pane holds any parameter record");
        params
    }
}

/// The 48-byte completion result pane.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CmplData(pub [u8; PANE_SIZE]);

impl CmplData {
    pub fn zeroed() -> CmplData {
        CmplData([0; PANE_SIZE])
    }

    /// Build a pane from a typed result record.
    pub fn of<R: IntoBytes + Immutable>(result: R) -> CmplData {
        const { assert!(size_of::<R>() <= PANE_SIZE) }
        let mut pane = [0; PANE_SIZE];
        pane[..size_of::<R>()].copy_from_slice(result.as_bytes());
        CmplData(pane)
    }

    /// Read a typed result record out of the pane.
    pub fn get<R: FromBytes>(&self) -> R {
        const { assert!(size_of::<R>() <= PANE_SIZE) }
        let (result, _) = R::read_from_prefix(&self.0).expect("pane holds any result record");
        result
    }
}

/// A command as it sits in the command ring.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FsCmd {
    pub id: u64,
    pub ty: u64,
    pub params: CmdParams,
}

/// A completion as it sits in the completion ring.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FsCmpl {
    pub id: u64,
    pub status: u64,
    pub data: CmplData,
}

/// One ring slot; commands and completions share the layout.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FsMsg(pub [u8; 64]);

impl FsMsg {
    pub fn zeroed() -> FsMsg {
        FsMsg([0; 64])
    }

    pub fn cmd(&self) -> FsCmd {
        FsCmd::read_from_bytes(&self.0).expect("slot and message sizes match")
    }

    pub fn cmpl(&self) -> FsCmpl {
        FsCmpl::read_from_bytes(&self.0).expect("slot and message sizes match")
    }
}

impl From<FsCmd> for FsMsg {
    fn from(cmd: FsCmd) -> FsMsg {
        FsMsg::read_from_bytes(cmd.as_bytes()).expect("slot and message sizes match")
    }
}

impl From<FsCmpl> for FsMsg {
    fn from(cmpl: FsCmpl) -> FsMsg {
        FsMsg::read_from_bytes(cmpl.as_bytes()).expect("slot and message sizes match")
    }
}

const _: () = assert!(size_of::<FsCmd>() == 64);
const _: () = assert!(size_of::<FsCmpl>() == 64);
const _: () = assert!(size_of::<FsMsg>() == 64);
const _: () = assert!(size_of::<FsStat>() == 136);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pane_round_trip() {
        let params = RwParams {
            fd: 3,
            offset: 0x1000,
            buf: FsBuffer { offset: 64, size: 128 },
        };
        let pane = CmdParams::of(params);
        let back: RwParams = pane.get();
        assert_eq!(back.fd, 3);
        assert_eq!(back.offset, 0x1000);
        assert_eq!(back.buf.offset, 64);
        assert_eq!(back.buf.size, 128);
    }

    #[test]
    fn message_views() {
        let cmd = FsCmd {
            id: 7,
            ty: CmdType::FileOpen.into(),
            params: CmdParams::of(OpenParams {
                path: FsBuffer { offset: 0, size: 2 },
                flags: OpenFlags::CREATE | OpenFlags::READ_WRITE,
            }),
        };
        let msg = FsMsg::from(cmd);
        assert_eq!(msg.cmd().id, 7);
        assert_eq!(msg.cmd().ty, u64::from(CmdType::FileOpen));
    }

    #[test]
    fn open_flag_translation() {
        assert!(OpenFlags(OpenFlags::READ_ONLY).readable());
        assert!(!OpenFlags(OpenFlags::READ_ONLY).writable());
        assert!(OpenFlags(OpenFlags::WRITE_ONLY).writable());
        assert!(!OpenFlags(OpenFlags::WRITE_ONLY).readable());
        assert!(OpenFlags(OpenFlags::READ_WRITE).readable());
        assert!(OpenFlags(OpenFlags::READ_WRITE).writable());
        // both low bits set grants neither direction
        assert!(!OpenFlags(3).readable());
        assert!(!OpenFlags(3).writable());
        assert!(OpenFlags(OpenFlags::CREATE | OpenFlags::WRITE_ONLY).create());
        assert!(!OpenFlags(OpenFlags::WRITE_ONLY).create());
    }

    #[test]
    fn command_enum_boundary() {
        assert_eq!(CmdType::try_from(0u64), Ok(CmdType::Initialise));
        assert_eq!(CmdType::try_from(19u64), Ok(CmdType::DirRewind));
        assert!(CmdType::try_from(FS_NUM_COMMANDS).is_err());
    }
}
