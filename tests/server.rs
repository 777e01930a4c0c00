//! End-to-end tests: a full server over an in-memory FAT16 image, with
//! this harness playing both the client and the block-device driver.
//!
//! The driver side is scripted: requests can be withheld per worker id and
//! released later, which is how the out-of-order completion scenario is
//! produced.

use std::cell::RefCell;
use std::rc::Rc;

use fatsrv::ll::blk::{
    BLK_QUEUE_CAPACITY, BLK_RESP_OK, BLK_TRANSFER_SIZE, BlkDriverHandle, BlkOp, BlkRequest,
    BlkStorageInfo, blk_queue_pair,
};
use fatsrv::ll::protocol::{
    CmdParams, CmdType, DirReadParams, DirReadResult, DirSeekParams, DirTellResult, FdParams,
    FsBuffer, FsCmd, FsCmpl, FsMsg, FsStat, OpenFlags, OpenParams, OpenResult, PathParams,
    ReadResult, RenameParams, RwParams, SizeResult, StatParams, Status, TruncateParams,
    WriteResult,
};
use zerocopy::FromBytes;
use fatsrv::ll::queue::FsQueue;
use fatsrv::{ChannelId, DataRegion, Server, Session};

const SECTOR_SIZE: usize = 512;
const TOTAL_SECTORS: usize = 20480;
/// Where the harness stages path strings in the client data region.
const PATH_OFF: u64 = 0x8000;
const PATH2_OFF: u64 = 0x9000;
/// Where the harness stages the stat output buffer.
const STAT_OFF: u64 = 0xA000;

const FAT_INVALID_PARAMETER: u64 = 19;

/// Format a FAT16 volume: 20480 sectors of 512 bytes, 4 sectors per
/// cluster, 2 FATs of 32 sectors, 512 root entries.
fn mkfs_fat16() -> Vec<u8> {
    let mut img = vec![0u8; TOTAL_SECTORS * SECTOR_SIZE];
    let put16 = |img: &mut Vec<u8>, off: usize, v: u16| {
        img[off..off + 2].copy_from_slice(&v.to_le_bytes());
    };
    put16(&mut img, 11, 512);
    img[13] = 4;
    put16(&mut img, 14, 1);
    img[16] = 2;
    put16(&mut img, 17, 512);
    put16(&mut img, 19, TOTAL_SECTORS as u16);
    img[21] = 0xF8;
    put16(&mut img, 22, 32);
    img[510] = 0x55;
    img[511] = 0xAA;
    // media and end-of-chain marks for the two reserved FAT entries, in
    // both FAT copies (sectors 1 and 33)
    for fat_sector in [1usize, 33] {
        let off = fat_sector * SECTOR_SIZE;
        put16(&mut img, off, 0xFFF8);
        put16(&mut img, off + 2, 0xFFFF);
    }
    img
}

type NotifyFn = Box<dyn Fn(ChannelId)>;

struct Harness {
    session: Session<NotifyFn>,
    cmd: Rc<FsQueue>,
    cmpl: Rc<FsQueue>,
    driver: BlkDriverHandle,
    data: DataRegion,
    blk_data: DataRegion,
    disk: Vec<u8>,
    notes: Rc<RefCell<Vec<ChannelId>>>,
    /// Requests withheld instead of answered (keyed by worker id).
    hold_id: Option<u32>,
    held: Vec<BlkRequest>,
}

impl Harness {
    fn new() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let disk = mkfs_fat16();
        let cmd = FsQueue::new();
        let cmpl = FsQueue::new();
        let (server_blk, driver) = blk_queue_pair(BLK_QUEUE_CAPACITY);
        let info = BlkStorageInfo::new(
            SECTOR_SIZE as u16,
            disk.len() as u64 / BLK_TRANSFER_SIZE,
        );
        info.set_ready(true);
        let data = DataRegion::new(1 << 20);
        let blk_data = DataRegion::new(512 * 1024);
        let server = Server::new(
            cmd.clone(),
            cmpl.clone(),
            server_blk,
            info,
            data.clone(),
            blk_data.clone(),
        );
        let notes: Rc<RefCell<Vec<ChannelId>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = notes.clone();
        let notify: NotifyFn = Box::new(move |ch| sink.borrow_mut().push(ch));
        Harness {
            session: Session::new(server, notify),
            cmd,
            cmpl,
            driver,
            data,
            blk_data,
            disk,
            notes,
            hold_id: None,
            held: Vec::new(),
        }
    }

    fn push_cmd(&self, id: u64, ty: CmdType, params: CmdParams) {
        self.push_raw(id, ty.into(), params);
    }

    fn push_raw(&self, id: u64, ty: u64, params: CmdParams) {
        self.cmd.idx_empty_write(0, FsMsg::from(FsCmd { id, ty, params }));
        self.cmd.publish_production(1);
    }

    fn respond(&mut self, req: BlkRequest) {
        let unit = BLK_TRANSFER_SIZE as usize;
        let start = req.sector as usize * unit;
        let len = req.count as usize * unit;
        assert!(start + len <= self.disk.len(), "extent stays on the device");
        match BlkOp::try_from(req.code).expect("request opcode") {
            BlkOp::Read => {
                self.blk_data
                    .write(req.data_offset, &self.disk[start..start + len])
                    .expect("read lands in the block data region");
            }
            BlkOp::Write => {
                let mut buf = vec![0u8; len];
                self.blk_data
                    .read(req.data_offset, &mut buf)
                    .expect("write sourced from the block data region");
                self.disk[start..start + len].copy_from_slice(&buf);
            }
            BlkOp::Flush => {}
        }
        self.driver
            .enqueue_resp(BLK_RESP_OK, req.count, req.id)
            .expect("response ring has room");
    }

    fn service_driver(&mut self) -> bool {
        let mut serviced = false;
        while let Some(req) = self.driver.dequeue_req() {
            if Some(req.id) == self.hold_id {
                self.held.push(req);
                continue;
            }
            self.respond(req);
            serviced = true;
        }
        serviced
    }

    /// Play the driver until the transport is quiet.
    fn crank(&mut self) {
        loop {
            if !self.service_driver() {
                return;
            }
            self.session.notified(ChannelId::Device);
        }
    }

    /// Deliver pending commands and run the exchange to quiescence.
    fn pump(&mut self) {
        self.session.notified(ChannelId::Client);
        self.crank();
    }

    fn release_held(&mut self) {
        for req in std::mem::take(&mut self.held) {
            self.respond(req);
        }
        self.session.notified(ChannelId::Device);
        self.crank();
    }

    fn completions(&mut self) -> Vec<FsCmpl> {
        let pending = self.cmpl.length_consumer();
        let mut all = Vec::new();
        for i in 0..pending {
            all.push(self.cmpl.idx_filled(i).cmpl());
        }
        self.cmpl.publish_consumption(pending);
        all
    }

    /// Submit one command and expect exactly one completion.
    fn run(&mut self, id: u64, ty: CmdType, params: CmdParams) -> FsCmpl {
        self.push_cmd(id, ty, params);
        self.pump();
        let mut all = self.completions();
        assert_eq!(all.len(), 1, "one completion for command {id}");
        let cmpl = all.pop().unwrap();
        assert_eq!(cmpl.id, id, "completion echoes the command id");
        cmpl
    }

    fn path_at(&self, off: u64, path: &str) -> FsBuffer {
        self.data.write(off, path.as_bytes()).unwrap();
        FsBuffer {
            offset: off,
            size: path.len() as u64,
        }
    }

    fn path(&self, path: &str) -> FsBuffer {
        self.path_at(PATH_OFF, path)
    }

    fn mount(&mut self) {
        let cmpl = self.run(1, CmdType::Initialise, CmdParams::zeroed());
        assert_eq!(cmpl.status, u64::from(Status::Success));
    }

    fn open(&mut self, id: u64, path: &str, flags: u64) -> u64 {
        let params = CmdParams::of(OpenParams {
            path: self.path(path),
            flags,
        });
        let cmpl = self.run(id, CmdType::FileOpen, params);
        assert_eq!(cmpl.status, u64::from(Status::Success), "open {path}");
        cmpl.data.get::<OpenResult>().fd
    }

    fn write_file(&mut self, id: u64, fd: u64, offset: u64, bytes: &[u8]) {
        self.data.write(0, bytes).unwrap();
        let params = CmdParams::of(RwParams {
            fd,
            offset,
            buf: FsBuffer {
                offset: 0,
                size: bytes.len() as u64,
            },
        });
        let cmpl = self.run(id, CmdType::FileWrite, params);
        assert_eq!(cmpl.status, u64::from(Status::Success));
        assert_eq!(cmpl.data.get::<WriteResult>().len_written, bytes.len() as u64);
    }

    fn read_file(&mut self, id: u64, fd: u64, offset: u64, at: u64, len: u64) -> Vec<u8> {
        let params = CmdParams::of(RwParams {
            fd,
            offset,
            buf: FsBuffer { offset: at, size: len },
        });
        let cmpl = self.run(id, CmdType::FileRead, params);
        assert_eq!(cmpl.status, u64::from(Status::Success));
        let n = cmpl.data.get::<ReadResult>().len_read;
        let mut out = vec![0u8; n as usize];
        self.data.read(at, &mut out).unwrap();
        out
    }

    fn close(&mut self, id: u64, fd: u64) {
        let cmpl = self.run(id, CmdType::FileClose, CmdParams::of(FdParams { fd }));
        assert_eq!(cmpl.status, u64::from(Status::Success));
    }

    /// List a directory through the protocol until end-of-directory.
    fn list_dir(&mut self, path: &str) -> Vec<String> {
        let params = CmdParams::of(PathParams { path: self.path(path) });
        let cmpl = self.run(800, CmdType::DirOpen, params);
        assert_eq!(cmpl.status, u64::from(Status::Success));
        let fd = cmpl.data.get::<OpenResult>().fd;
        let mut names = Vec::new();
        for i in 0..1000u64 {
            let params = CmdParams::of(DirReadParams {
                fd,
                buf: FsBuffer { offset: 0, size: 256 },
            });
            let cmpl = self.run(810 + i, CmdType::DirRead, params);
            if cmpl.status == u64::from(Status::EndOfDirectory) {
                break;
            }
            assert_eq!(cmpl.status, u64::from(Status::Success));
            let len = cmpl.data.get::<DirReadResult>().path_len;
            assert!(len <= 255);
            let mut name = vec![0u8; len as usize];
            self.data.read(0, &mut name).unwrap();
            names.push(String::from_utf8(name).unwrap());
        }
        let cmpl = self.run(890, CmdType::DirClose, CmdParams::of(FdParams { fd }));
        assert_eq!(cmpl.status, u64::from(Status::Success));
        names
    }
}

#[test]
fn mount_reports_success() {
    let mut h = Harness::new();
    let cmpl = h.run(1, CmdType::Initialise, CmdParams::zeroed());
    assert_eq!(cmpl.status, u64::from(Status::Success));
    assert!(h.notes.borrow().contains(&ChannelId::Client));
}

#[test]
fn second_mount_is_rejected_as_busy() {
    let mut h = Harness::new();
    h.mount();
    let cmpl = h.run(2, CmdType::Initialise, CmdParams::zeroed());
    assert_eq!(cmpl.status, FAT_INVALID_PARAMETER);
}

#[test]
fn unmount_then_operations_fail() {
    let mut h = Harness::new();
    let cmpl = h.run(1, CmdType::Deinitialise, CmdParams::zeroed());
    assert_eq!(cmpl.status, FAT_INVALID_PARAMETER, "unmount without mount");
    h.mount();
    let cmpl = h.run(2, CmdType::Deinitialise, CmdParams::zeroed());
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let params = CmdParams::of(OpenParams {
        path: h.path("/x"),
        flags: OpenFlags::CREATE | OpenFlags::READ_WRITE,
    });
    let cmpl = h.run(3, CmdType::FileOpen, params);
    assert_eq!(cmpl.status, u64::from(Status::Error));
}

#[test]
fn write_then_read_round_trips() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/a", OpenFlags::CREATE | OpenFlags::READ_WRITE);
    h.data.write(0, b"hello").unwrap();
    let params = CmdParams::of(RwParams {
        fd,
        offset: 0,
        buf: FsBuffer { offset: 0, size: 5 },
    });
    let cmpl = h.run(4, CmdType::FileWrite, params);
    assert_eq!(cmpl.status, u64::from(Status::Success));
    assert_eq!(cmpl.data.get::<WriteResult>().len_written, 5);

    let params = CmdParams::of(RwParams {
        fd,
        offset: 0,
        buf: FsBuffer { offset: 16, size: 5 },
    });
    let cmpl = h.run(5, CmdType::FileRead, params);
    assert_eq!(cmpl.status, u64::from(Status::Success));
    assert_eq!(cmpl.data.get::<ReadResult>().len_read, 5);
    let mut back = [0u8; 5];
    h.data.read(16, &mut back).unwrap();
    assert_eq!(&back, b"hello");

    h.close(6, fd);
    // the descriptor is dead after close
    let params = CmdParams::of(RwParams {
        fd,
        offset: 0,
        buf: FsBuffer { offset: 16, size: 5 },
    });
    let cmpl = h.run(7, CmdType::FileRead, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidFd));
}

#[test]
fn data_survives_close_and_reopen() {
    let mut h = Harness::new();
    h.mount();
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let fd = h.open(3, "/big.bin", OpenFlags::CREATE | OpenFlags::READ_WRITE);
    h.write_file(4, fd, 0, &payload);
    h.close(5, fd);

    let fd = h.open(6, "/big.bin", OpenFlags::READ_ONLY);
    let back = h.read_file(7, fd, 0, 0x1000, 8000);
    assert_eq!(back.len(), 5000, "short read at end of file");
    assert_eq!(back, payload);
    // unaligned interior read
    let back = h.read_file(8, fd, 777, 0x1000, 1000);
    assert_eq!(back, payload[777..1777]);
    h.close(9, fd);
}

#[test]
fn unaligned_overwrite_is_read_modify_write() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/rmw", OpenFlags::CREATE | OpenFlags::READ_WRITE);
    let base: Vec<u8> = vec![0xAA; 3000];
    h.write_file(4, fd, 0, &base);
    // overwrite a span that is aligned to neither sector nor cluster
    h.write_file(5, fd, 700, b"patched");
    let back = h.read_file(6, fd, 0, 0, 3000);
    let mut expect = base.clone();
    expect[700..707].copy_from_slice(b"patched");
    assert_eq!(back, expect);
    h.close(7, fd);
}

#[test]
fn file_size_and_truncate() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/t", OpenFlags::CREATE | OpenFlags::READ_WRITE);
    h.write_file(4, fd, 0, &[7u8; 10]);
    let cmpl = h.run(5, CmdType::FileSize, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.data.get::<SizeResult>().size, 10);

    let cmpl = h.run(6, CmdType::FileTruncate, CmdParams::of(TruncateParams { fd, length: 4 }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let cmpl = h.run(7, CmdType::FileSize, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.data.get::<SizeResult>().size, 4);
    let back = h.read_file(8, fd, 0, 0, 100);
    assert_eq!(back, vec![7u8; 4]);

    // truncate can also grow, through the seek-extension path
    let cmpl = h.run(
        9,
        CmdType::FileTruncate,
        CmdParams::of(TruncateParams { fd, length: 8192 }),
    );
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let cmpl = h.run(10, CmdType::FileSize, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.data.get::<SizeResult>().size, 8192);
    let back = h.read_file(11, fd, 4096, 0, 100);
    assert_eq!(back, vec![0u8; 100], "grown region reads as zeroes");
    h.close(12, fd);
}

#[test]
fn sync_is_idempotent() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/s", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    h.write_file(4, fd, 0, b"data");
    for id in [5u64, 6] {
        let cmpl = h.run(id, CmdType::FileSync, CmdParams::of(FdParams { fd }));
        assert_eq!(cmpl.status, u64::from(Status::Success));
    }
    h.close(7, fd);
}

#[test]
fn access_mode_is_enforced() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/m", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    h.write_file(4, fd, 0, b"xyz");
    let params = CmdParams::of(RwParams {
        fd,
        offset: 0,
        buf: FsBuffer { offset: 0, size: 3 },
    });
    let cmpl = h.run(5, CmdType::FileRead, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidRead));
    h.close(6, fd);

    let fd = h.open(7, "/m", OpenFlags::READ_ONLY);
    h.data.write(0, b"abc").unwrap();
    let params = CmdParams::of(RwParams {
        fd,
        offset: 0,
        buf: FsBuffer { offset: 0, size: 3 },
    });
    let cmpl = h.run(8, CmdType::FileWrite, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidWrite));
    h.close(9, fd);
}

#[test]
fn invalid_command_types_produce_no_completion() {
    let mut h = Harness::new();
    h.push_raw(50, 999, CmdParams::zeroed());
    h.push_cmd(51, CmdType::Initialise, CmdParams::zeroed());
    h.pump();
    let all = h.completions();
    assert_eq!(all.len(), 1, "the invalid command is consumed silently");
    assert_eq!(all[0].id, 51);
}

#[test]
fn out_of_region_buffers_are_rejected() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/b", OpenFlags::CREATE | OpenFlags::READ_WRITE);
    let region = h.data.len() as u64;
    let params = CmdParams::of(RwParams {
        fd,
        offset: 0,
        buf: FsBuffer { offset: region - 4, size: 8 },
    });
    let cmpl = h.run(4, CmdType::FileRead, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidBuffer));

    // an out-of-region path is a path error, not a buffer error
    let params = CmdParams::of(OpenParams {
        path: FsBuffer { offset: region, size: 4 },
        flags: OpenFlags::READ_ONLY,
    });
    let cmpl = h.run(5, CmdType::FileOpen, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidPath));
    h.close(6, fd);
}

#[test]
fn directory_listing_reaches_end_and_stays_there() {
    let mut h = Harness::new();
    h.mount();
    for (id, name) in [(3, "/a.txt"), (5, "/b.txt")] {
        let fd = h.open(id, name, OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
        h.close(id + 1, fd);
    }
    let cmpl = h.run(7, CmdType::DirCreate, CmdParams::of(PathParams { path: h.path("/sub") }));
    assert_eq!(cmpl.status, u64::from(Status::Success));

    let mut names = h.list_dir("/");
    names.sort();
    assert_eq!(names, ["a.txt", "b.txt", "sub"]);

    // a drained directory keeps reporting end-of-directory
    let params = CmdParams::of(PathParams { path: h.path("/sub") });
    let cmpl = h.run(8, CmdType::DirOpen, params);
    let fd = cmpl.data.get::<OpenResult>().fd;
    for id in [9u64, 10] {
        let params = CmdParams::of(DirReadParams {
            fd,
            buf: FsBuffer { offset: 0, size: 256 },
        });
        let cmpl = h.run(id, CmdType::DirRead, params);
        assert_eq!(cmpl.status, u64::from(Status::EndOfDirectory));
        assert_eq!(cmpl.data.get::<DirReadResult>().path_len, 0);
    }
    let cmpl = h.run(11, CmdType::DirClose, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
}

#[test]
fn dir_tell_seek_rewind_agree() {
    let mut h = Harness::new();
    h.mount();
    for (id, name) in [(3, "/one"), (5, "/two"), (7, "/three")] {
        let fd = h.open(id, name, OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
        h.close(id + 1, fd);
    }
    let ordered = h.list_dir("/");

    let params = CmdParams::of(PathParams { path: h.path("/") });
    let cmpl = h.run(20, CmdType::DirOpen, params);
    let fd = cmpl.data.get::<OpenResult>().fd;

    let read_one = |h: &mut Harness, id: u64| -> String {
        let params = CmdParams::of(DirReadParams {
            fd,
            buf: FsBuffer { offset: 0, size: 256 },
        });
        let cmpl = h.run(id, CmdType::DirRead, params);
        assert_eq!(cmpl.status, u64::from(Status::Success));
        let len = cmpl.data.get::<DirReadResult>().path_len as usize;
        let mut name = vec![0u8; len];
        h.data.read(0, &mut name).unwrap();
        String::from_utf8(name).unwrap()
    };

    assert_eq!(read_one(&mut h, 21), ordered[0]);
    let cmpl = h.run(22, CmdType::DirTell, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.data.get::<DirTellResult>().location, 1);

    let cmpl = h.run(23, CmdType::DirSeek, CmdParams::of(DirSeekParams { fd, loc: 2 }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
    assert_eq!(read_one(&mut h, 24), ordered[2]);

    let cmpl = h.run(25, CmdType::DirRewind, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
    assert_eq!(read_one(&mut h, 26), ordered[0]);

    let cmpl = h.run(27, CmdType::DirClose, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
}

#[test]
fn long_names_survive_listing_and_case_insensitive_lookup() {
    let mut h = Harness::new();
    h.mount();
    let name = "/long name with spaces.txt";
    let fd = h.open(3, name, OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    h.write_file(4, fd, 0, b"lfn");
    h.close(5, fd);

    let names = h.list_dir("/");
    assert_eq!(names, ["long name with spaces.txt"]);

    let fd = h.open(6, "/LONG NAME WITH SPACES.TXT", OpenFlags::READ_ONLY);
    assert_eq!(h.read_file(7, fd, 0, 0, 16), b"lfn");
    h.close(8, fd);
}

#[test]
fn stat_projects_attributes() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/st", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    h.write_file(4, fd, 0, &[1u8; 123]);
    h.close(5, fd);
    let cmpl = h.run(6, CmdType::DirCreate, CmdParams::of(PathParams { path: h.path("/d") }));
    assert_eq!(cmpl.status, u64::from(Status::Success));

    let read_stat = |h: &mut Harness, id: u64, path: &str| -> FsStat {
        let params = CmdParams::of(StatParams {
            path: h.path(path),
            buf: FsBuffer {
                offset: STAT_OFF,
                size: size_of::<FsStat>() as u64,
            },
        });
        let cmpl = h.run(id, CmdType::Stat, params);
        assert_eq!(cmpl.status, u64::from(Status::Success), "stat {path}");
        let mut raw = vec![0u8; size_of::<FsStat>()];
        h.data.read(STAT_OFF, &mut raw).unwrap();
        FsStat::read_from_bytes(&raw).unwrap()
    };

    let st = read_stat(&mut h, 7, "/st");
    assert_eq!(st.size, 123);
    assert_eq!(st.blksize, 512);
    assert_eq!(st.mode, 0o444);
    assert_eq!(st.atime, st.mtime);
    assert_eq!(st.mtime, st.ctime);

    let st = read_stat(&mut h, 8, "/d");
    assert_eq!(st.mode, 0o40755);

    // undersized stat buffers are rejected before any lookup
    let params = CmdParams::of(StatParams {
        path: h.path("/st"),
        buf: FsBuffer { offset: STAT_OFF, size: 16 },
    });
    let cmpl = h.run(9, CmdType::Stat, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidBuffer));
}

#[test]
fn rename_and_remove() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/old", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    h.write_file(4, fd, 0, b"keep");
    h.close(5, fd);

    let params = CmdParams::of(RenameParams {
        old_path: h.path_at(PATH_OFF, "/old"),
        new_path: h.path_at(PATH2_OFF, "/new"),
    });
    let cmpl = h.run(6, CmdType::Rename, params);
    assert_eq!(cmpl.status, u64::from(Status::Success));

    let params = CmdParams::of(OpenParams {
        path: h.path("/old"),
        flags: OpenFlags::READ_ONLY,
    });
    let cmpl = h.run(7, CmdType::FileOpen, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidPath));

    let fd = h.open(8, "/new", OpenFlags::READ_ONLY);
    assert_eq!(h.read_file(9, fd, 0, 0, 16), b"keep");
    h.close(10, fd);

    let cmpl = h.run(11, CmdType::FileRemove, CmdParams::of(PathParams { path: h.path("/new") }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let params = CmdParams::of(OpenParams {
        path: h.path("/new"),
        flags: OpenFlags::READ_ONLY,
    });
    let cmpl = h.run(12, CmdType::FileOpen, params);
    assert_eq!(cmpl.status, u64::from(Status::InvalidPath));
}

#[test]
fn directories_create_nest_and_remove() {
    let mut h = Harness::new();
    h.mount();
    let cmpl = h.run(3, CmdType::DirCreate, CmdParams::of(PathParams { path: h.path("/d") }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let cmpl = h.run(4, CmdType::DirCreate, CmdParams::of(PathParams { path: h.path("/d") }));
    assert_eq!(cmpl.status, u64::from(Status::Error), "mkdir over an existing path");

    let fd = h.open(5, "/d/inner.txt", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    h.write_file(6, fd, 0, b"deep");
    h.close(7, fd);
    assert_eq!(h.list_dir("/d"), ["inner.txt"]);

    let cmpl = h.run(8, CmdType::DirRemove, CmdParams::of(PathParams { path: h.path("/d") }));
    assert_eq!(cmpl.status, u64::from(Status::ServerDenied), "non-empty directory");

    let cmpl = h.run(
        9,
        CmdType::FileRemove,
        CmdParams::of(PathParams { path: h.path("/d/inner.txt") }),
    );
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let cmpl = h.run(10, CmdType::DirRemove, CmdParams::of(PathParams { path: h.path("/d") }));
    assert_eq!(cmpl.status, u64::from(Status::Success));

    let cmpl = h.run(11, CmdType::DirOpen, CmdParams::of(PathParams { path: h.path("/d") }));
    assert_eq!(cmpl.status, u64::from(Status::InvalidPath));
}

#[test]
fn dir_descriptor_table_exhausts() {
    let mut h = Harness::new();
    h.mount();
    let mut fds = Vec::new();
    for i in 0..16u64 {
        let params = CmdParams::of(PathParams { path: h.path("/") });
        let cmpl = h.run(100 + i, CmdType::DirOpen, params);
        assert_eq!(cmpl.status, u64::from(Status::Success));
        fds.push(cmpl.data.get::<OpenResult>().fd);
    }
    let params = CmdParams::of(PathParams { path: h.path("/") });
    let cmpl = h.run(200, CmdType::DirOpen, params);
    assert_eq!(cmpl.status, u64::from(Status::TooManyOpenFiles));
    // close one and the slot is reusable
    let cmpl = h.run(201, CmdType::DirClose, CmdParams::of(FdParams { fd: fds[0] }));
    assert_eq!(cmpl.status, u64::from(Status::Success));
    let params = CmdParams::of(PathParams { path: h.path("/") });
    let cmpl = h.run(202, CmdType::DirOpen, params);
    assert_eq!(cmpl.status, u64::from(Status::Success));
    assert_eq!(cmpl.data.get::<OpenResult>().fd, fds[0]);
}

#[test]
fn held_completion_reorders_client_completions() {
    let mut h = Harness::new();
    h.mount();
    for (id, name, body) in [(3, "/f1", b"one"), (6, "/f2", b"two")] {
        let fd = h.open(id, name, OpenFlags::CREATE | OpenFlags::READ_WRITE);
        h.write_file(id + 1, fd, 0, body);
        h.close(id + 2, fd);
    }
    let fd1 = h.open(10, "/f1", OpenFlags::READ_ONLY);
    let fd2 = h.open(11, "/f2", OpenFlags::READ_ONLY);

    // withhold the first worker's disk traffic; both reads are submitted
    // in the same activation, so the first command lands on worker 1
    h.hold_id = Some(1);
    h.push_cmd(
        100,
        CmdType::FileRead,
        CmdParams::of(RwParams {
            fd: fd1,
            offset: 0,
            buf: FsBuffer { offset: 0, size: 3 },
        }),
    );
    h.push_cmd(
        101,
        CmdType::FileRead,
        CmdParams::of(RwParams {
            fd: fd2,
            offset: 0,
            buf: FsBuffer { offset: 8, size: 3 },
        }),
    );
    h.pump();

    let first = h.completions();
    assert_eq!(first.len(), 1, "only the unheld read completed");
    assert_eq!(first[0].id, 101);
    assert_eq!(first[0].status, u64::from(Status::Success));

    h.hold_id = None;
    h.release_held();
    let second = h.completions();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, 100);
    assert_eq!(second[0].status, u64::from(Status::Success));

    let mut buf = [0u8; 3];
    h.data.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"one");
    h.data.read(8, &mut buf).unwrap();
    assert_eq!(&buf, b"two");
}

#[test]
fn concurrent_close_on_busy_fd_reports_outstanding_operations() {
    let mut h = Harness::new();
    h.mount();
    let fd = h.open(3, "/busy", OpenFlags::CREATE | OpenFlags::READ_WRITE);
    h.write_file(4, fd, 0, b"payload");
    h.close(5, fd);
    let fd = h.open(6, "/busy", OpenFlags::READ_ONLY);

    // the read parks worker 1 inside the disk adapter with the
    // descriptor borrowed
    h.hold_id = Some(1);
    h.push_cmd(
        100,
        CmdType::FileRead,
        CmdParams::of(RwParams {
            fd,
            offset: 0,
            buf: FsBuffer { offset: 0, size: 7 },
        }),
    );
    h.pump();
    assert!(h.completions().is_empty());

    let cmpl = h.run(101, CmdType::FileClose, CmdParams::of(FdParams { fd }));
    assert_eq!(cmpl.status, u64::from(Status::OutstandingOperations));

    h.hold_id = None;
    h.release_held();
    let done = h.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, 100);
    assert_eq!(done[0].status, u64::from(Status::Success));
    h.close(102, fd);
}
