//! Replay source for classic pcap capture files.
//!
//! Reads the libpcap container directly (both byte orders, microsecond and
//! nanosecond variants) and strips link headers with `pnet` packet views.
//! Non-UDP records are skipped at this boundary; the rest of the pipeline
//! never sees them.

use std::fs::File;
use std::io::{BufReader, Read};
use std::net::Ipv4Addr;
use std::path::Path;

use bytes::Bytes;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use super::{CaptureError, ClockDomain, Endpoint, PacketSource, RawPacket};

const MAGIC_US: u32 = 0xa1b2_c3d4;
const MAGIC_NS: u32 = 0xa1b2_3c4d;
const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: u32 = 101;
const MAX_SNAPLEN: u32 = 256 * 1024;

pub struct PcapReplay {
    reader: BufReader<File>,
    swapped: bool,
    nanos: bool,
    link_type: u32,
}

impl PcapReplay {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; 24];
        reader.read_exact(&mut header)?;
        let raw_magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let (swapped, nanos) = match raw_magic {
            MAGIC_US => (false, false),
            MAGIC_NS => (false, true),
            m if m.swap_bytes() == MAGIC_US => (true, false),
            m if m.swap_bytes() == MAGIC_NS => (true, true),
            m => return Err(CaptureError::BadMagic { magic: m }),
        };
        let link_type = read_u32(&header[20..24], swapped);
        if link_type != LINKTYPE_ETHERNET && link_type != LINKTYPE_RAW {
            return Err(CaptureError::UnsupportedLinkType(link_type));
        }

        Ok(Self {
            reader,
            swapped,
            nanos,
            link_type,
        })
    }

    /// Read the next record, whatever it contains. `None` at end of file.
    fn next_record(&mut self) -> Result<Option<(f64, Vec<u8>)>, CaptureError> {
        let mut header = [0u8; 16];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let ts_sec = read_u32(&header[0..4], self.swapped);
        let ts_frac = read_u32(&header[4..8], self.swapped);
        let incl_len = read_u32(&header[8..12], self.swapped);
        if incl_len > MAX_SNAPLEN {
            return Err(CaptureError::TruncatedRecord);
        }

        let mut data = vec![0u8; incl_len as usize];
        self.reader
            .read_exact(&mut data)
            .map_err(|_| CaptureError::TruncatedRecord)?;

        let frac = if self.nanos {
            f64::from(ts_frac) / 1e9
        } else {
            f64::from(ts_frac) / 1e6
        };
        Ok(Some((f64::from(ts_sec) + frac, data)))
    }

    fn parse_udp(&self, data: &[u8]) -> Option<RawPacket> {
        let ip_bytes = match self.link_type {
            LINKTYPE_ETHERNET => {
                let eth = EthernetPacket::new(data)?;
                if eth.get_ethertype() != EtherTypes::Ipv4 {
                    return None;
                }
                eth.payload().to_vec()
            }
            _ => data.to_vec(),
        };
        let ip = Ipv4Packet::new(&ip_bytes)?;
        if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
            return None;
        }
        let src_ip: Ipv4Addr = ip.get_source();
        let dst_ip: Ipv4Addr = ip.get_destination();
        let udp = UdpPacket::new(ip.payload())?;
        // Trust the UDP length field, not the frame: short frames are
        // padded to the Ethernet minimum and the padding is not payload.
        let payload_len = (udp.get_length() as usize).checked_sub(8)?;
        let payload = udp.payload();
        let payload = payload.get(..payload_len.min(payload.len()))?;
        Some(RawPacket {
            ts: 0.0,
            src: Endpoint::new(src_ip, udp.get_source()),
            dst: Endpoint::new(dst_ip, udp.get_destination()),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

impl PacketSource for PcapReplay {
    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        loop {
            let Some((ts, data)) = self.next_record()? else {
                return Ok(None);
            };
            if let Some(mut packet) = self.parse_udp(&data) {
                packet.ts = ts;
                return Ok(Some(packet));
            }
        }
    }

    fn clock(&self) -> ClockDomain {
        ClockDomain::File
    }
}

fn read_u32(bytes: &[u8], swapped: bool) -> u32 {
    let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if swapped {
        raw.swap_bytes()
    } else {
        raw
    }
}
