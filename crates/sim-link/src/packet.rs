//! Datagram layouts of the simulator's UDP protocol.
//!
//! Every packet starts with a four-letter ASCII tag and one separator byte.
//! Integers and floats are little-endian. Name fields are fixed width.

use crate::{Result, SimLinkError};
use std::net::Ipv4Addr;

pub const TAG_SUBSCRIBE: &[u8; 4] = b"RREF";
pub const TAG_WRITE: &[u8; 4] = b"DREF";
pub const TAG_COMMAND: &[u8; 4] = b"CMND";
pub const TAG_DATA_SELECT: &[u8; 4] = b"DSEL";
pub const TAG_OUTPUT_TARGET: &[u8; 4] = b"ISE4";
pub const TAG_BEACON: &[u8; 4] = b"BECN";
pub const TAG_DATA: &[u8; 4] = b"DATA";

pub const SUBSCRIBE_NAME_LEN: usize = 400;
pub const WRITE_NAME_LEN: usize = 500;
pub const COMMAND_NAME_LEN: usize = 500;

/// Total size of a write packet: tag, separator, value, name field.
pub const WRITE_PACKET_LEN: usize = 5 + 4 + WRITE_NAME_LEN;

/// `ISE4` slot selecting the address that receives `DATA` output.
pub const OUTPUT_TARGET_SLOT: i32 = 64;

const HEADER_LEN: usize = 5;
const RECORD_LEN: usize = 8;
const DATA_ROW_LEN: usize = 4 + 8 * 4;
const BEACON_PORT_OFFSET: usize = 19;
const BEACON_NAME_OFFSET: usize = 21;

fn header(tag: &[u8; 4], capacity: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(capacity);
    out.extend_from_slice(tag);
    out.push(0);
    out
}

fn check_name(name: &str, field: usize) -> Result<()> {
    // One byte of the field is kept for the terminator.
    if name.is_empty() || name.len() >= field {
        return Err(SimLinkError::InvalidName {
            name: name.to_string(),
            max: field - 1,
        });
    }
    Ok(())
}

/// `RREF`: ask for `name` at `frequency` Hz under `index`. Frequency 0 cancels.
pub fn encode_subscribe(frequency: i32, index: i32, name: &str) -> Result<Vec<u8>> {
    check_name(name, SUBSCRIBE_NAME_LEN)?;
    let mut out = header(TAG_SUBSCRIBE, HEADER_LEN + 8 + SUBSCRIBE_NAME_LEN);
    out.extend_from_slice(&frequency.to_le_bytes());
    out.extend_from_slice(&index.to_le_bytes());
    let mut field = [0u8; SUBSCRIBE_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);
    Ok(out)
}

/// `DREF`: set `name` to `value`. The name field is space-filled with a null
/// right after the name.
pub fn encode_write(name: &str, value: f32) -> Result<Vec<u8>> {
    check_name(name, WRITE_NAME_LEN)?;
    let mut out = header(TAG_WRITE, WRITE_PACKET_LEN);
    out.extend_from_slice(&value.to_le_bytes());
    let mut field = [b' '; WRITE_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field[name.len()] = 0;
    out.extend_from_slice(&field);
    Ok(out)
}

/// `CMND`: fire a one-shot command.
pub fn encode_command(name: &str) -> Result<Vec<u8>> {
    check_name(name, COMMAND_NAME_LEN)?;
    let mut out = header(TAG_COMMAND, HEADER_LEN + COMMAND_NAME_LEN);
    let mut field = [0u8; COMMAND_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);
    Ok(out)
}

/// `DSEL`: choose which data-output rows the simulator streams.
pub fn encode_data_select(rows: &[i32]) -> Vec<u8> {
    let mut out = header(TAG_DATA_SELECT, HEADER_LEN + rows.len() * 4);
    for row in rows {
        out.extend_from_slice(&row.to_le_bytes());
    }
    out
}

/// `ISE4`: point the simulator's data output at `ip:port`.
pub fn encode_output_target(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut out = header(TAG_OUTPUT_TARGET, HEADER_LEN + 4 + 16 + 8 + 4);
    out.extend_from_slice(&OUTPUT_TARGET_SLOT.to_le_bytes());
    let mut ip_field = [0u8; 16];
    let ip_text = ip.to_string();
    ip_field[..ip_text.len()].copy_from_slice(ip_text.as_bytes());
    out.extend_from_slice(&ip_field);
    let mut port_field = [0u8; 8];
    let port_text = port.to_string();
    port_field[..port_text.len()].copy_from_slice(port_text.as_bytes());
    out.extend_from_slice(&port_field);
    out.extend_from_slice(&1i32.to_le_bytes());
    out
}

/// Discovery beacon announced by a running simulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Beacon {
    pub major: u8,
    pub minor: u8,
    pub host_id: i32,
    pub version: i32,
    pub role: u32,
    pub port: u16,
    pub computer_name: String,
}

impl Beacon {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = header(TAG_BEACON, BEACON_NAME_OFFSET + self.computer_name.len() + 1);
        out.push(self.major);
        out.push(self.minor);
        out.extend_from_slice(&self.host_id.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.role.to_le_bytes());
        out.extend_from_slice(&self.port.to_le_bytes());
        out.extend_from_slice(self.computer_name.as_bytes());
        out.push(0);
        out
    }
}

/// One row of the periodic `DATA` stream: a row index and eight floats.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRow {
    pub index: i32,
    pub values: [f32; 8],
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundPacket {
    /// Subscribed values reported by index.
    Values(Vec<(i32, f32)>),
    /// A single value reported by name.
    Named { name: String, value: f32 },
    Beacon(Beacon),
    Data(Vec<DataRow>),
}

/// Decode any datagram the simulator sends us.
pub fn decode(datagram: &[u8]) -> Result<InboundPacket> {
    if datagram.len() < 4 {
        return Err(SimLinkError::InvalidPacket("short header"));
    }
    let tag = &datagram[..4];
    if tag == TAG_SUBSCRIBE {
        decode_values(datagram).map(InboundPacket::Values)
    } else if tag == TAG_WRITE {
        decode_write(datagram).map(|(name, value)| InboundPacket::Named { name, value })
    } else if tag == TAG_BEACON {
        decode_beacon(datagram).map(InboundPacket::Beacon)
    } else if tag == TAG_DATA {
        decode_data(datagram).map(InboundPacket::Data)
    } else {
        Err(SimLinkError::UnknownTag(
            String::from_utf8_lossy(tag).into_owned(),
        ))
    }
}

/// `RREF` report: tag, optional separator, then `(index, value)` records.
pub fn decode_values(datagram: &[u8]) -> Result<Vec<(i32, f32)>> {
    let body_len = datagram.len().saturating_sub(4);
    let start = if body_len % RECORD_LEN == 0 {
        4
    } else if body_len % RECORD_LEN == 1 {
        HEADER_LEN
    } else {
        return Err(SimLinkError::InvalidPacket("ragged value records"));
    };
    Ok(datagram[start..]
        .chunks_exact(RECORD_LEN)
        .map(|rec| (read_i32(&rec[0..4]), read_f32(&rec[4..8])))
        .collect())
}

/// Write packet or by-name report: tag, separator, value, null-terminated name.
pub fn decode_write(datagram: &[u8]) -> Result<(String, f32)> {
    if datagram.len() < HEADER_LEN + 4 + 1 {
        return Err(SimLinkError::InvalidPacket("short write packet"));
    }
    if &datagram[..4] != TAG_WRITE {
        return Err(SimLinkError::InvalidPacket("not a write packet"));
    }
    let value = read_f32(&datagram[HEADER_LEN..HEADER_LEN + 4]);
    let name = read_cstr(&datagram[HEADER_LEN + 4..]);
    if name.is_empty() {
        return Err(SimLinkError::InvalidPacket("empty name"));
    }
    Ok((name, value))
}

pub fn decode_beacon(datagram: &[u8]) -> Result<Beacon> {
    if datagram.len() < BEACON_NAME_OFFSET || &datagram[..4] != TAG_BEACON {
        return Err(SimLinkError::InvalidPacket("short beacon"));
    }
    Ok(Beacon {
        major: datagram[5],
        minor: datagram[6],
        host_id: read_i32(&datagram[7..11]),
        version: read_i32(&datagram[11..15]),
        role: u32::from_le_bytes([datagram[15], datagram[16], datagram[17], datagram[18]]),
        port: u16::from_le_bytes([
            datagram[BEACON_PORT_OFFSET],
            datagram[BEACON_PORT_OFFSET + 1],
        ]),
        computer_name: read_cstr(&datagram[BEACON_NAME_OFFSET..]),
    })
}

pub fn decode_data(datagram: &[u8]) -> Result<Vec<DataRow>> {
    let body = datagram
        .get(HEADER_LEN..)
        .ok_or(SimLinkError::InvalidPacket("short data packet"))?;
    if body.len() % DATA_ROW_LEN != 0 {
        return Err(SimLinkError::InvalidPacket("ragged data rows"));
    }
    Ok(body
        .chunks_exact(DATA_ROW_LEN)
        .map(|row| {
            let mut values = [0f32; 8];
            for (i, v) in values.iter_mut().enumerate() {
                let at = 4 + i * 4;
                *v = read_f32(&row[at..at + 4]);
            }
            DataRow {
                index: read_i32(&row[0..4]),
                values,
            }
        })
        .collect())
}

fn read_i32(b: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[..4]);
    i32::from_le_bytes(buf)
}

fn read_f32(b: &[u8]) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[..4]);
    f32::from_le_bytes(buf)
}

fn read_cstr(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_packet_layout() {
        let pkt = encode_write("sim/test/x", 3.5).unwrap();
        assert_eq!(pkt.len(), WRITE_PACKET_LEN);
        assert_eq!(pkt.len(), 509);
        assert_eq!(&pkt[..5], b"DREF\0");
        assert_eq!(&pkt[5..9], &3.5f32.to_le_bytes());
        assert_eq!(&pkt[9..19], b"sim/test/x");
        assert_eq!(pkt[19], 0);
        assert!(pkt[20..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn write_packet_round_trips() {
        let pkt = encode_write("sim/test/x", 3.5).unwrap();
        assert_eq!(decode_write(&pkt).unwrap(), ("sim/test/x".to_string(), 3.5));
    }

    #[test]
    fn subscribe_packet_layout() {
        let pkt = encode_subscribe(10, 7, "sim/flightmodel/position/indicated_airspeed").unwrap();
        assert_eq!(pkt.len(), 5 + 8 + SUBSCRIBE_NAME_LEN);
        assert_eq!(&pkt[..5], b"RREF\0");
        assert_eq!(&pkt[5..9], &10i32.to_le_bytes());
        assert_eq!(&pkt[9..13], &7i32.to_le_bytes());
        assert!(pkt[13 + 43..].iter().all(|&b| b == 0));
    }

    #[test]
    fn command_packet_is_null_padded() {
        let pkt = encode_command("sim/lights/beacon_lights_toggle").unwrap();
        assert_eq!(pkt.len(), 505);
        assert_eq!(&pkt[..5], b"CMND\0");
        assert!(pkt[5 + 31..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_names_are_rejected() {
        let long = "x".repeat(WRITE_NAME_LEN);
        assert!(encode_write(&long, 1.0).is_err());
        assert!(encode_subscribe(1, 0, &"y".repeat(SUBSCRIBE_NAME_LEN)).is_err());
        assert!(encode_command("").is_err());
    }

    #[test]
    fn value_reports_accept_both_header_forms() {
        let mut with_sep = b"RREF,".to_vec();
        let mut bare = b"RREF".to_vec();
        for (idx, v) in [(1i32, 2.5f32), (4, -1.0)] {
            for buf in [&mut with_sep, &mut bare] {
                buf.extend_from_slice(&idx.to_le_bytes());
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        let expect = vec![(1, 2.5), (4, -1.0)];
        assert_eq!(decode_values(&with_sep).unwrap(), expect);
        assert_eq!(decode_values(&bare).unwrap(), expect);
        assert!(decode_values(b"RREF,abc").is_err());
    }

    #[test]
    fn beacon_port_is_read_at_fixed_offset() {
        let beacon = Beacon {
            major: 1,
            minor: 2,
            host_id: 1,
            version: 120_001,
            role: 1,
            port: 49_005,
            computer_name: "sim-pc".into(),
        };
        let pkt = beacon.encode();
        assert_eq!(&pkt[19..21], &49_005u16.to_le_bytes());
        assert_eq!(decode(&pkt).unwrap(), InboundPacket::Beacon(beacon));
    }

    #[test]
    fn unknown_tags_are_errors() {
        assert!(matches!(decode(b"ZZZZ\0"), Err(SimLinkError::UnknownTag(_))));
        assert!(decode(b"RR").is_err());
    }

    #[test]
    fn output_target_and_select_layouts() {
        let pkt = encode_output_target(Ipv4Addr::new(192, 168, 1, 20), 49_003);
        assert_eq!(pkt.len(), 5 + 4 + 16 + 8 + 4);
        assert_eq!(&pkt[5..9], &64i32.to_le_bytes());
        assert_eq!(&pkt[9..21], b"192.168.1.20");
        assert_eq!(&pkt[25..30], b"49003");
        let sel = encode_data_select(&[3, 17]);
        assert_eq!(sel.len(), 13);
        assert_eq!(&sel[9..13], &17i32.to_le_bytes());
    }

    #[test]
    fn data_rows_decode() {
        let mut pkt = b"DATA*".to_vec();
        pkt.extend_from_slice(&3i32.to_le_bytes());
        for i in 0..8 {
            pkt.extend_from_slice(&(i as f32).to_le_bytes());
        }
        let rows = decode_data(&pkt).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].index, 3);
        assert_eq!(rows[0].values[7], 7.0);
    }
}
