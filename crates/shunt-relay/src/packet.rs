use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketError {
    Truncated,
    Malformed(&'static str),
}

/// A UDP datagram lifted out of a raw IPv4 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UdpDatagramV4<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parses an IPv4 frame (as read from a raw UDP socket, IP header included)
/// into its UDP datagram. Checksums are not verified; the kernel already
/// dropped frames with bad ones.
pub(crate) fn parse_udp_ipv4(frame: &[u8]) -> Result<UdpDatagramV4<'_>, PacketError> {
    if frame.len() < 20 {
        return Err(PacketError::Truncated);
    }
    let version = frame[0] >> 4;
    let ihl = (frame[0] & 0x0f) as usize;
    if version != 4 || ihl < 5 {
        return Err(PacketError::Malformed("invalid IPv4 header"));
    }
    let header_len = ihl * 4;
    let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if total_len < header_len || frame.len() < total_len {
        return Err(PacketError::Truncated);
    }
    let protocol = frame[9];
    if protocol != libc::IPPROTO_UDP as u8 {
        return Err(PacketError::Malformed("not UDP"));
    }
    let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

    let udp = &frame[header_len..total_len];
    if udp.len() < 8 {
        return Err(PacketError::Truncated);
    }
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < 8 || udp_len > udp.len() {
        return Err(PacketError::Malformed("bad UDP length"));
    }

    Ok(UdpDatagramV4 {
        src,
        dst,
        src_port: u16::from_be_bytes([udp[0], udp[1]]),
        dst_port: u16::from_be_bytes([udp[2], udp[3]]),
        payload: &udp[8..udp_len],
    })
}

/// Builds a raw IPv4+UDP frame; test traffic for the broadcast relay.
#[cfg(test)]
pub(crate) fn build_udp_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut out = vec![0u8; 20];
    out[0] = (4 << 4) | 5; // version + IHL
    out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    out[8] = 64; // TTL
    out[9] = libc::IPPROTO_UDP as u8;
    out[12..16].copy_from_slice(&src.octets());
    out[16..20].copy_from_slice(&dst.octets());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&(udp_len as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum left clear
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_broadcast_frame() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(192, 168, 1, 255);
        let frame = build_udp_ipv4(src, dst, 6112, 6112, b"announce");

        let datagram = parse_udp_ipv4(&frame).unwrap();
        assert_eq!(src, datagram.src);
        assert_eq!(dst, datagram.dst);
        assert_eq!(6112, datagram.src_port);
        assert_eq!(6112, datagram.dst_port);
        assert_eq!(b"announce", datagram.payload);
    }

    #[test]
    fn rejects_non_udp_and_truncated_frames() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(255, 255, 255, 255);

        let mut tcp = build_udp_ipv4(src, dst, 80, 80, b"x");
        tcp[9] = libc::IPPROTO_TCP as u8;
        assert!(matches!(parse_udp_ipv4(&tcp), Err(PacketError::Malformed(_))));

        let frame = build_udp_ipv4(src, dst, 80, 80, b"payload");
        assert!(matches!(
            parse_udp_ipv4(&frame[..frame.len() - 4]),
            Err(PacketError::Truncated),
        ));
        assert!(matches!(parse_udp_ipv4(&frame[..10]), Err(PacketError::Truncated)));

        let mut bad_version = frame.clone();
        bad_version[0] = (6 << 4) | 5;
        assert!(matches!(
            parse_udp_ipv4(&bad_version),
            Err(PacketError::Malformed(_)),
        ));
    }

    #[test]
    fn honors_udp_length_over_trailing_bytes() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 255);
        let mut frame = build_udp_ipv4(src, dst, 1000, 2000, b"data");
        // Raw reads can return padding past the IP total length.
        frame.extend_from_slice(&[0xaa; 6]);

        let datagram = parse_udp_ipv4(&frame).unwrap();
        assert_eq!(b"data", datagram.payload);
    }
}
