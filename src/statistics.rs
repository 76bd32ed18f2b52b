// rsyn: wire-compatible rsync reimplementation in Rust.

//! Statistics/counter structs.

use crate::buffer::Buffer;

/// Counters the server reports at the end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatistics {
    pub total_bytes_read: i64,
    pub total_bytes_written: i64,
    pub total_file_size: i64,
    pub flist_build_time: i64,
    pub flist_xfer_time: i64,
}

impl ServerStatistics {
    /// Unpack the statistics block from the demultiplexed data stream.
    ///
    /// Returns `None` with the cursor unmoved until the whole block has
    /// arrived. The two list-timing counters are only on the wire from
    /// protocol 29; below that they read as zero.
    pub fn unpack(buf: &mut Buffer, protocol_version: i32) -> Option<ServerStatistics> {
        let start = buf.pos();
        let count = if protocol_version >= 29 { 5 } else { 3 };
        let mut fields = [0i64; 5];
        for field in fields.iter_mut().take(count) {
            match buf.unpack_s64() {
                Some(v) => *field = v,
                None => {
                    buf.set_pos(start);
                    return None;
                }
            }
        }
        Some(ServerStatistics {
            total_bytes_read: fields[0],
            total_bytes_written: fields[1],
            total_file_size: fields[2],
            flist_build_time: fields[3],
            flist_xfer_time: fields[4],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unpack_is_restartable() {
        let mut wire = Buffer::new();
        wire.pack_s64(10);
        wire.pack_s64(20);
        wire.pack_s64(1 << 40);
        wire.pack_s64(3);
        wire.pack_s64(4);
        let bytes = wire.take();

        let mut buf = Buffer::new();
        buf.append(&bytes[..7]);
        assert_eq!(ServerStatistics::unpack(&mut buf, 30), None);
        assert_eq!(buf.pos(), 0);
        buf.append(&bytes[7..]);
        let stats = ServerStatistics::unpack(&mut buf, 30).unwrap();
        assert_eq!(stats.total_bytes_read, 10);
        assert_eq!(stats.total_bytes_written, 20);
        assert_eq!(stats.total_file_size, 1 << 40);
        assert_eq!(stats.flist_build_time, 3);
        assert_eq!(stats.flist_xfer_time, 4);
    }
}
