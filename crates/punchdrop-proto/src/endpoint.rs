//! Socket endpoint encoding: 1-byte address length, address bytes (4 for
//! IPv4, 16 for IPv6), 2-byte port. Used by COORD_OK and COORD_PEER_INFO.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::packet::PacketError;

/// Encode an endpoint into its wire form.
pub fn encode_endpoint(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(16);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode an endpoint from a payload.
pub fn decode_endpoint(data: &[u8]) -> Result<SocketAddr, PacketError> {
    if data.is_empty() {
        return Err(PacketError::TruncatedPayload("endpoint"));
    }
    let addr_len = data[0] as usize;
    if data.len() < 1 + addr_len + 2 {
        return Err(PacketError::TruncatedPayload("endpoint"));
    }
    let ip: IpAddr = match addr_len {
        4 => {
            let octets: [u8; 4] = data[1..5].try_into().unwrap();
            Ipv4Addr::from(octets).into()
        }
        16 => {
            let octets: [u8; 16] = data[1..17].try_into().unwrap();
            Ipv6Addr::from(octets).into()
        }
        _ => return Err(PacketError::TruncatedPayload("endpoint")),
    };
    let port = u16::from_be_bytes(data[1 + addr_len..1 + addr_len + 2].try_into().unwrap());
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let addr: SocketAddr = "203.0.113.9:4567".parse().unwrap();
        let encoded = encode_endpoint(addr);
        assert_eq!(encoded.len(), 7);
        assert_eq!(decode_endpoint(&encoded).unwrap(), addr);
    }

    #[test]
    fn roundtrip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let encoded = encode_endpoint(addr);
        assert_eq!(encoded.len(), 19);
        assert_eq!(decode_endpoint(&encoded).unwrap(), addr);
    }

    #[test]
    fn truncated_rejected() {
        let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
        let encoded = encode_endpoint(addr);
        assert!(decode_endpoint(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_endpoint(&[]).is_err());
        assert!(decode_endpoint(&[7, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
