//! Command handlers.
//!
//! One handler per protocol command. Each runs inside a worker coroutine:
//! it validates the client's parameters against the shared data region,
//! walks the descriptor tables, calls into the FAT driver (suspending in
//! the disk adapter as needed) and produces the status word and result
//! pane the dispatcher copies into the completion.
//!
//! Status policy: failures the server detects itself use the wire status
//! codes; failures from the FAT driver map onto the wire vocabulary where
//! an equivalent exists and otherwise round-trip the driver's classic
//! numeric code.

use std::rc::Rc;

use zerocopy::{Immutable, IntoBytes};

use crate::diskio::BlockDisk;
use crate::fat::{Attributes, FatError, FatVolume, FileMode};
use crate::ll::protocol::{
    CmdParams, CmdType, CmplData, DirReadParams, DirReadResult, DirSeekParams, DirTellResult,
    FS_MAX_PATH_LENGTH, FdParams, FsBuffer, FsStat, OpenFlags, OpenParams, OpenResult, PathParams,
    ReadResult, RenameParams, RwParams, SizeResult, StatParams, Status, TruncateParams,
    WriteResult,
};
use crate::pool::CoroHandle;
use crate::server::{DescStatus, Server};

/// The classic FAT "invalid parameter" code has no wire equivalent and
/// round-trips numerically (a busy mount surfaces as this).
const FAT_INVALID_PARAMETER: u64 = 19;

type Outcome = (u64, CmplData);

fn status_of(e: FatError) -> u64 {
    match e {
        FatError::Disk(_) | FatError::Internal | FatError::Exists => Status::Error.into(),
        FatError::NoFilesystem => Status::Error.into(),
        FatError::NoFile | FatError::NoPath => Status::InvalidPath.into(),
        FatError::InvalidName => Status::InvalidName.into(),
        FatError::Denied => Status::ServerDenied.into(),
        FatError::InvalidParameter => FAT_INVALID_PARAMETER,
        FatError::ReadDenied => Status::InvalidRead.into(),
        FatError::WriteDenied => Status::InvalidWrite.into(),
        FatError::DirectoryFull => Status::DirectoryFull.into(),
    }
}

fn ok() -> Outcome {
    (Status::Success.into(), CmplData::zeroed())
}

fn ok_with<R: IntoBytes + Immutable>(result: R) -> Outcome {
    (Status::Success.into(), CmplData::of(result))
}

fn fail(status: Status) -> Outcome {
    (status.into(), CmplData::zeroed())
}

fn fat_fail(e: FatError) -> Outcome {
    log::debug!("backend failure: {e}");
    (status_of(e), CmplData::zeroed())
}

/// Copy a client path out of the data region into server-private memory.
fn copy_path(server: &Server, buf: FsBuffer) -> Result<String, Status> {
    if buf.size > FS_MAX_PATH_LENGTH || server.data.check(buf.offset, buf.size).is_err() {
        return Err(Status::InvalidPath);
    }
    let mut bytes = vec![0u8; buf.size as usize];
    server
        .data
        .read(buf.offset, &mut bytes)
        .map_err(|_| Status::InvalidPath)?;
    String::from_utf8(bytes).map_err(|_| Status::InvalidPath)
}

fn volume(server: &Server) -> Result<Rc<FatVolume>, Status> {
    // operations against an unmounted server fail like the library's
    // not-enabled state
    server.mounted_volume().ok_or(Status::Error)
}

/// The worker coroutine body: run the command, store the result into the
/// worker's request record for the dispatcher to harvest.
pub(crate) async fn worker_entry(
    server: Rc<Server>,
    handle: CoroHandle,
    ty: CmdType,
    params: CmdParams,
) {
    let (status, data) = dispatch(&server, handle, ty, params).await;
    server.record(handle).complete(status, data);
}

async fn dispatch(
    server: &Rc<Server>,
    handle: CoroHandle,
    ty: CmdType,
    params: CmdParams,
) -> Outcome {
    log::debug!("worker {}: {:?}", handle.get(), ty);
    let disk = BlockDisk::new(server.clone(), handle);
    match ty {
        CmdType::Initialise => mount(server, &disk).await,
        CmdType::Deinitialise => unmount(server, &disk).await,
        CmdType::FileOpen => file_open(server, &disk, params.get()).await,
        CmdType::FileClose => file_close(server, &disk, params.get()).await,
        CmdType::Stat => stat(server, &disk, params.get()).await,
        CmdType::FileRead => file_read(server, &disk, params.get()).await,
        CmdType::FileWrite => file_write(server, &disk, params.get()).await,
        CmdType::FileSize => file_size(server, params.get()),
        CmdType::Rename => rename(server, &disk, params.get()).await,
        CmdType::FileRemove => file_remove(server, &disk, params.get()).await,
        CmdType::FileTruncate => file_truncate(server, &disk, params.get()).await,
        CmdType::DirCreate => dir_create(server, &disk, params.get()).await,
        CmdType::DirRemove => dir_remove(server, &disk, params.get()).await,
        CmdType::DirOpen => dir_open(server, &disk, params.get()).await,
        CmdType::DirClose => dir_close(server, &disk, params.get()).await,
        CmdType::FileSync => file_sync(server, &disk, params.get()).await,
        CmdType::DirRead => dir_read(server, &disk, params.get()).await,
        CmdType::DirSeek => dir_seek(server, &disk, params.get()).await,
        CmdType::DirTell => dir_tell(server, params.get()),
        CmdType::DirRewind => dir_rewind(server, params.get()),
    }
}

async fn mount(server: &Rc<Server>, disk: &BlockDisk) -> Outcome {
    if server.volumes.status(0) != DescStatus::Free {
        log::warn!("mount rejected: volume slot busy");
        return (FAT_INVALID_PARAMETER, CmplData::zeroed());
    }
    server.volumes.set_status(0, DescStatus::InUse);
    match FatVolume::mount(disk).await {
        Ok(vol) => {
            *server.volumes.obj(0).borrow_mut() = Some(Rc::new(vol));
            ok()
        }
        Err(e) => {
            server.volumes.set_status(0, DescStatus::Free);
            fat_fail(e)
        }
    }
}

async fn unmount(server: &Rc<Server>, disk: &BlockDisk) -> Outcome {
    if server.volumes.status(0) != DescStatus::InUse {
        return (FAT_INVALID_PARAMETER, CmplData::zeroed());
    }
    let outstanding = server
        .volumes
        .obj(0)
        .borrow()
        .as_ref()
        .is_some_and(|vol| Rc::strong_count(vol) > 1);
    if outstanding {
        return fail(Status::OutstandingOperations);
    }
    let Some(vol) = server.volumes.obj(0).borrow().clone() else {
        return fail(Status::Error);
    };
    server.volumes.set_status(0, DescStatus::Cleanup);
    match vol.unmount(disk).await {
        Ok(()) => {
            *server.volumes.obj(0).borrow_mut() = None;
            server.volumes.set_status(0, DescStatus::Free);
            ok()
        }
        Err(e) => {
            server.volumes.set_status(0, DescStatus::InUse);
            fat_fail(e)
        }
    }
}

async fn file_open(server: &Rc<Server>, disk: &BlockDisk, p: OpenParams) -> Outcome {
    let path = match copy_path(server, p.path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let flags = OpenFlags(p.flags);
    let mut mode = FileMode::empty();
    if flags.readable() {
        mode |= FileMode::READ;
    }
    if flags.writable() {
        mode |= FileMode::WRITE;
    }
    let Some(fd) = server.files.find_free() else {
        return fail(Status::TooManyOpenFiles);
    };
    server.files.set_status(fd, DescStatus::InUse);
    log::trace!("open {path:?} flags {:#x} -> fd {fd}", p.flags);
    match vol.open(disk, &path, mode, flags.create()).await {
        Ok(file) => {
            *server.files.obj(fd).borrow_mut() = Some(file);
            ok_with(OpenResult { fd: fd as u64 })
        }
        Err(e) => {
            server.files.set_status(fd, DescStatus::Free);
            fat_fail(e)
        }
    }
}

async fn file_close(server: &Rc<Server>, disk: &BlockDisk, p: FdParams) -> Outcome {
    let Some(fd) = server.files.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.files.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(file) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    server.files.set_status(fd, DescStatus::Cleanup);
    match vol.close(disk, file).await {
        Ok(()) => {
            *slot = None;
            server.files.set_status(fd, DescStatus::Free);
            ok()
        }
        Err(e) => {
            server.files.set_status(fd, DescStatus::InUse);
            fat_fail(e)
        }
    }
}

async fn file_read(server: &Rc<Server>, disk: &BlockDisk, p: RwParams) -> Outcome {
    if server.data.check(p.buf.offset, p.buf.size).is_err() {
        return fail(Status::InvalidBuffer);
    }
    let Some(fd) = server.files.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.files.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(file) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    if let Err(e) = vol.seek(disk, file, p.offset).await {
        return fat_fail(e);
    }
    let mut data = vec![0u8; p.buf.size as usize];
    match vol.read(disk, file, &mut data).await {
        Ok(n) => {
            if server.data.write(p.buf.offset, &data[..n]).is_err() {
                return fail(Status::InvalidBuffer);
            }
            log::trace!("read fd {fd}: {n} bytes at {}", p.offset);
            ok_with(ReadResult { len_read: n as u64 })
        }
        Err(e) => fat_fail(e),
    }
}

async fn file_write(server: &Rc<Server>, disk: &BlockDisk, p: RwParams) -> Outcome {
    if server.data.check(p.buf.offset, p.buf.size).is_err() {
        return fail(Status::InvalidBuffer);
    }
    let Some(fd) = server.files.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.files.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(file) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    let mut data = vec![0u8; p.buf.size as usize];
    if server.data.read(p.buf.offset, &mut data).is_err() {
        return fail(Status::InvalidBuffer);
    }
    if let Err(e) = vol.seek(disk, file, p.offset).await {
        return fat_fail(e);
    }
    match vol.write(disk, file, &data).await {
        Ok(n) => {
            log::trace!("write fd {fd}: {n} bytes at {}", p.offset);
            ok_with(WriteResult { len_written: n as u64 })
        }
        Err(e) => fat_fail(e),
    }
}

fn file_size(server: &Rc<Server>, p: FdParams) -> Outcome {
    let Some(fd) = server.files.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let Ok(slot) = server.files.obj(fd).try_borrow() else {
        return fail(Status::OutstandingOperations);
    };
    match slot.as_ref() {
        Some(file) => ok_with(SizeResult { size: file.size() }),
        None => fail(Status::InvalidFd),
    }
}

async fn file_truncate(server: &Rc<Server>, disk: &BlockDisk, p: TruncateParams) -> Outcome {
    let Some(fd) = server.files.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.files.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(file) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    // position at the requested length, then cut there
    if let Err(e) = vol.seek(disk, file, p.length).await {
        return fat_fail(e);
    }
    match vol.truncate(disk, file).await {
        Ok(()) => ok(),
        Err(e) => fat_fail(e),
    }
}

async fn file_sync(server: &Rc<Server>, disk: &BlockDisk, p: FdParams) -> Outcome {
    let Some(fd) = server.files.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.files.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(file) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    match vol.sync(disk, file).await {
        Ok(()) => ok(),
        Err(e) => fat_fail(e),
    }
}

async fn stat(server: &Rc<Server>, disk: &BlockDisk, p: StatParams) -> Outcome {
    let path = match copy_path(server, p.path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    if p.buf.size < size_of::<FsStat>() as u64 || server.data.check(p.buf.offset, p.buf.size).is_err()
    {
        return fail(Status::InvalidBuffer);
    }
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    match vol.lookup(disk, &path).await {
        Ok(info) => {
            let mut st = FsStat::default();
            st.size = u64::from(info.size);
            st.blksize = u64::from(vol.sector_size());
            st.atime = info.timestamp();
            st.mtime = info.timestamp();
            st.ctime = info.timestamp();
            st.mode = if info.is_dir() {
                u64::from(libc::S_IFDIR) | 0o755
            } else {
                let mut mode = 0o444;
                if info.attr.contains(Attributes::READ_ONLY) {
                    mode &= !0o222;
                }
                mode
            };
            if server.data.write_val(p.buf.offset, &st).is_err() {
                return fail(Status::InvalidBuffer);
            }
            ok()
        }
        Err(e) => fat_fail(e),
    }
}

async fn rename(server: &Rc<Server>, disk: &BlockDisk, p: RenameParams) -> Outcome {
    let old_path = match copy_path(server, p.old_path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let new_path = match copy_path(server, p.new_path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    match vol.rename(disk, &old_path, &new_path).await {
        Ok(()) => ok(),
        Err(e) => fat_fail(e),
    }
}

async fn file_remove(server: &Rc<Server>, disk: &BlockDisk, p: PathParams) -> Outcome {
    let path = match copy_path(server, p.path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    match vol.unlink(disk, &path).await {
        Ok(()) => ok(),
        Err(e) => fat_fail(e),
    }
}

async fn dir_create(server: &Rc<Server>, disk: &BlockDisk, p: PathParams) -> Outcome {
    let path = match copy_path(server, p.path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    match vol.mkdir(disk, &path).await {
        Ok(()) => ok(),
        Err(e) => fat_fail(e),
    }
}

async fn dir_remove(server: &Rc<Server>, disk: &BlockDisk, p: PathParams) -> Outcome {
    let path = match copy_path(server, p.path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    match vol.rmdir(disk, &path).await {
        Ok(()) => ok(),
        Err(e) => fat_fail(e),
    }
}

async fn dir_open(server: &Rc<Server>, disk: &BlockDisk, p: PathParams) -> Outcome {
    let path = match copy_path(server, p.path) {
        Ok(path) => path,
        Err(s) => return fail(s),
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Some(fd) = server.dirs.find_free() else {
        return fail(Status::TooManyOpenFiles);
    };
    server.dirs.set_status(fd, DescStatus::InUse);
    match vol.opendir(disk, &path).await {
        Ok(handle) => {
            *server.dirs.obj(fd).borrow_mut() = Some(handle);
            ok_with(OpenResult { fd: fd as u64 })
        }
        Err(e) => {
            server.dirs.set_status(fd, DescStatus::Free);
            fat_fail(e)
        }
    }
}

async fn dir_close(server: &Rc<Server>, disk: &BlockDisk, p: FdParams) -> Outcome {
    let Some(fd) = server.dirs.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.dirs.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(handle) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    server.dirs.set_status(fd, DescStatus::Cleanup);
    match vol.closedir(disk, handle).await {
        Ok(()) => {
            *slot = None;
            server.dirs.set_status(fd, DescStatus::Free);
            ok()
        }
        Err(e) => {
            server.dirs.set_status(fd, DescStatus::InUse);
            fat_fail(e)
        }
    }
}

async fn dir_read(server: &Rc<Server>, disk: &BlockDisk, p: DirReadParams) -> Outcome {
    if server.data.check(p.buf.offset, p.buf.size).is_err() {
        return fail(Status::InvalidBuffer);
    }
    let Some(fd) = server.dirs.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.dirs.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(handle) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    match vol.readdir(disk, handle).await {
        Ok(Some(entry)) => {
            let name = entry.name.as_bytes();
            if name.len() as u64 > p.buf.size || server.data.write(p.buf.offset, name).is_err() {
                return fail(Status::InvalidBuffer);
            }
            log::trace!("readdir fd {fd}: {:?}", entry.name);
            ok_with(DirReadResult {
                path_len: name.len() as u64,
            })
        }
        Ok(None) => (
            Status::EndOfDirectory.into(),
            CmplData::of(DirReadResult { path_len: 0 }),
        ),
        Err(e) => fat_fail(e),
    }
}

async fn dir_seek(server: &Rc<Server>, disk: &BlockDisk, p: DirSeekParams) -> Outcome {
    let Some(fd) = server.dirs.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let vol = match volume(server) {
        Ok(vol) => vol,
        Err(s) => return fail(s),
    };
    let Ok(mut slot) = server.dirs.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    let Some(handle) = slot.as_mut() else {
        return fail(Status::InvalidFd);
    };
    // no native seek exists: rewind and replay `loc` reads
    handle.rewind();
    for _ in 0..p.loc {
        if let Err(e) = vol.readdir(disk, handle).await {
            return fat_fail(e);
        }
    }
    ok()
}

fn dir_tell(server: &Rc<Server>, p: FdParams) -> Outcome {
    let Some(fd) = server.dirs.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let Ok(slot) = server.dirs.obj(fd).try_borrow() else {
        return fail(Status::OutstandingOperations);
    };
    match slot.as_ref() {
        Some(handle) => ok_with(DirTellResult {
            location: handle.location(),
        }),
        None => fail(Status::InvalidFd),
    }
}

fn dir_rewind(server: &Rc<Server>, p: FdParams) -> Outcome {
    let Some(fd) = server.dirs.validate(p.fd) else {
        return fail(Status::InvalidFd);
    };
    let Ok(mut slot) = server.dirs.obj(fd).try_borrow_mut() else {
        return fail(Status::OutstandingOperations);
    };
    match slot.as_mut() {
        Some(handle) => {
            handle.rewind();
            ok()
        }
        None => fail(Status::InvalidFd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_onto_wire_codes() {
        assert_eq!(status_of(FatError::NoFile), u64::from(Status::InvalidPath));
        assert_eq!(status_of(FatError::NoPath), u64::from(Status::InvalidPath));
        assert_eq!(status_of(FatError::InvalidName), u64::from(Status::InvalidName));
        assert_eq!(status_of(FatError::Denied), u64::from(Status::ServerDenied));
        assert_eq!(status_of(FatError::ReadDenied), u64::from(Status::InvalidRead));
        assert_eq!(status_of(FatError::WriteDenied), u64::from(Status::InvalidWrite));
        assert_eq!(status_of(FatError::DirectoryFull), u64::from(Status::DirectoryFull));
        assert_eq!(status_of(FatError::InvalidParameter), FAT_INVALID_PARAMETER);
        assert_eq!(
            status_of(FatError::Disk(crate::fat::DiskError(3))),
            u64::from(Status::Error)
        );
    }
}
