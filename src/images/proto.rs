// SPDX-License-Identifier: BSD-3-Clause

//! Protobuf schemas of the checkpoint records we consume. Field numbers follow the checkpoint
//! tool's `fdinfo.proto`, `regfile.proto` and `fown.proto`; fields we never read are still
//! declared so that re-encoded fixtures look like the real thing.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FdTypes {
    Und = 0,
    Reg = 1,
    Pipe = 2,
    Fifo = 3,
    Inetsk = 4,
    Unixsk = 5,
    Eventfd = 6,
    Eventpoll = 7,
    Inotify = 8,
    Signalfd = 9,
    Packetsk = 10,
    Tty = 11,
    Fanotify = 12,
    Netlinksk = 13,
    Ns = 14,
    Tunf = 15,
    Ext = 16,
    Timerfd = 17,
    Memfd = 18,
    Bpfmap = 19,
    Pidfd = 20,
}

/// One open descriptor of a checkpointed task, from `fdinfo-<n>.img`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FdinfoEntry {
    #[prost(uint32, required, tag = "1")]
    pub id: u32,
    #[prost(uint32, required, tag = "2")]
    pub flags: u32,
    #[prost(enumeration = "FdTypes", required, tag = "3")]
    pub r#type: i32,
    #[prost(uint32, required, tag = "4")]
    pub fd: u32,
    #[prost(string, optional, tag = "5")]
    pub xattr_security_selinux: Option<String>,
}

impl FdinfoEntry {
    pub fn is_regular_file(&self) -> bool {
        self.r#type == FdTypes::Reg as i32
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FownEntry {
    #[prost(uint32, required, tag = "1")]
    pub uid: u32,
    #[prost(uint32, required, tag = "2")]
    pub euid: u32,
    #[prost(uint32, required, tag = "3")]
    pub signum: u32,
    #[prost(uint32, required, tag = "4")]
    pub pid_type: u32,
    #[prost(uint32, required, tag = "5")]
    pub pid: u32,
}

/// A regular file referenced by the checkpoint, from `reg-files.img`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegFileEntry {
    #[prost(uint32, required, tag = "1")]
    pub id: u32,
    #[prost(uint32, required, tag = "2")]
    pub flags: u32,
    #[prost(uint64, required, tag = "3")]
    pub pos: u64,
    #[prost(message, required, tag = "5")]
    pub fown: FownEntry,
    #[prost(string, required, tag = "6")]
    pub name: String,
    #[prost(sint32, optional, tag = "7")]
    pub mnt_id: Option<i32>,
    #[prost(uint64, optional, tag = "8")]
    pub size: Option<u64>,
    #[prost(bool, optional, tag = "9")]
    pub ext: Option<bool>,
    #[prost(uint32, optional, tag = "10")]
    pub mode: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn fdinfo_field_numbers() {
        // id=1, flags=2, type=REG, fd=3
        let bytes = [0x08, 0x01, 0x10, 0x02, 0x18, 0x01, 0x20, 0x03];
        let entry = FdinfoEntry::decode(&bytes[..]).unwrap();
        assert_eq!(entry.id, 1);
        assert_eq!(entry.flags, 2);
        assert_eq!(entry.fd, 3);
        assert!(entry.is_regular_file());
    }

    #[test]
    fn regfile_field_numbers() {
        // id=7, name="/a", size=300, mode=0o100644
        let mut bytes = vec![0x08, 0x07, 0x32, 0x02, b'/', b'a', 0x40, 0xac, 0x02];
        bytes.extend_from_slice(&[0x50, 0xa4, 0x83, 0x02]);
        let entry = RegFileEntry::decode(&bytes[..]).unwrap();
        assert_eq!(entry.id, 7);
        assert_eq!(entry.name, "/a");
        assert_eq!(entry.size, Some(300));
        assert_eq!(entry.mode, Some(0o100644));
        assert_eq!(entry.mnt_id, None);
    }
}
