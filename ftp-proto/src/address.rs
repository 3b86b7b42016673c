//! PORT / PASV address encoding.
//!
//! An address travels as comma-separated decimal octets: the IP address bytes
//! followed by the port, high byte first.  IPv4 gives 6 fields, IPv6 gives 18.
//!
//! ```text
//!  127.0.0.1:1080  ──▶  127,0,0,1,4,56
//!  PASV reply      ──▶  227 Entering passive mode (127,0,0,1,4,56)
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::protocol::ProtocolError;

const V4_FIELDS: usize = 6;
const V6_FIELDS: usize = 18;

/// Encode `addr` for a `PORT` argument.
pub fn build_port_string(addr: &SocketAddr) -> String {
    let mut octets: Vec<u8> = match addr {
        SocketAddr::V4(a) => a.ip().octets().to_vec(),
        SocketAddr::V6(a) => a.ip().octets().to_vec(),
    };
    octets.extend_from_slice(&addr.port().to_be_bytes());

    octets
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Encode `addr` for a 227 reply: the PORT form wrapped in parentheses.
pub fn build_pasv_string(addr: &SocketAddr) -> String {
    format!("({})", build_port_string(addr))
}

/// Decode a `PORT` argument.
///
/// Leading and trailing whitespace is ignored.  Every field must be a decimal
/// number in `0..=255` and there must be exactly 6 or 18 of them.
pub fn parse_port_string(text: &str) -> Result<SocketAddr, ProtocolError> {
    let bad = || ProtocolError::BadPortString(text.to_string());

    let fields = text
        .trim()
        .split(',')
        .map(|f| {
            if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            f.parse::<u8>().map_err(|_| bad())
        })
        .collect::<Result<Vec<u8>, _>>()?;

    match fields.len() {
        V4_FIELDS => {
            let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
            let port = u16::from_be_bytes([fields[4], fields[5]]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        V6_FIELDS => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&fields[..16]);
            let port = u16::from_be_bytes([fields[16], fields[17]]);
            Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
        }
        _ => Err(bad()),
    }
}

/// Decode the address embedded in a 227 reply text.
///
/// The first parenthesised group is handed to [`parse_port_string`].
pub fn parse_pasv_reply(text: &str) -> Result<SocketAddr, ProtocolError> {
    let bad = || ProtocolError::BadPasvReply(text.to_string());

    let open = text.find('(').ok_or_else(bad)?;
    let inner = &text[open + 1..];
    let close = inner.find(')').ok_or_else(bad)?;
    if close == 0 {
        return Err(bad());
    }
    parse_port_string(&inner[..close]).map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_port_string_is_six_fields() {
        let addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        assert_eq!(build_port_string(&addr), "127,0,0,1,4,56");
        assert_eq!(build_pasv_string(&addr), "(127,0,0,1,4,56)");
    }

    #[test]
    fn ipv6_port_string_is_eighteen_fields() {
        let addr: SocketAddr = "[::1]:21".parse().unwrap();
        let s = build_port_string(&addr);
        assert_eq!(s.split(',').count(), 18);
        assert!(s.ends_with(",0,1,0,21"));
    }

    #[test]
    fn parse_accepts_leading_spaces() {
        let addr = parse_port_string("   10,1,2,3,0,20").unwrap();
        assert_eq!(addr, "10.1.2.3:20".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert!(parse_port_string("1,2,3,4,5").is_err());
        assert!(parse_port_string("1,2,3,4,5,6,7").is_err());
        assert!(parse_port_string("").is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_and_garbage() {
        assert!(parse_port_string("256,0,0,1,0,21").is_err());
        assert!(parse_port_string("a,b,c,d,e,f").is_err());
        assert!(parse_port_string("1,2,,4,5,6").is_err());
        assert!(parse_port_string("-1,2,3,4,5,6").is_err());
    }

    #[test]
    fn pasv_reply_uses_first_group() {
        let addr = parse_pasv_reply("Entering passive mode (192,168,0,9,39,16) (1,1,1,1,0,1)").unwrap();
        assert_eq!(addr, "192.168.0.9:10000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn pasv_reply_without_group_fails() {
        assert!(parse_pasv_reply("Entering passive mode").is_err());
        assert!(parse_pasv_reply("Entering passive mode ()").is_err());
        assert!(parse_pasv_reply("Entering passive mode (1,2,3,4,5,6").is_err());
    }
}
