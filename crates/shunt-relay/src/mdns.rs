use std::net::Ipv4Addr;

const DNS_HEADER_LEN: usize = 12;
/// A-record resource type.
const TYPE_A: u16 = 1;
/// Fixed part of a resource record after the name: type, class, TTL, rdlength.
const RR_FIXED_LEN: usize = 10;

/// Rewrites mDNS A records advertising `guest_ip` so they advertise `lan_ip`
/// instead, letting a guest publish services reachable from the physical LAN
/// without knowledge of the NAT in between.
///
/// The rewrite happens in place and never changes the datagram length.
/// Returns the number of records rewritten; a datagram that does not parse as
/// DNS is left untouched.
pub fn translate_mdns_ip(lan_ip: Ipv4Addr, guest_ip: Ipv4Addr, data: &mut [u8]) -> usize {
    if guest_ip.is_unspecified() {
        return 0;
    }
    let Some(spans) = a_record_rdata_offsets(data) else {
        return 0;
    };

    let guest = guest_ip.octets();
    let mut rewritten = 0;
    for offset in spans {
        if data[offset..offset + 4] == guest {
            data[offset..offset + 4].copy_from_slice(&lan_ip.octets());
            rewritten += 1;
        }
    }
    rewritten
}

/// Offsets of every A-record rdata field in a DNS message, walking the
/// question section and then all answer/authority/additional records.
fn a_record_rdata_offsets(data: &[u8]) -> Option<Vec<usize>> {
    if data.len() < DNS_HEADER_LEN {
        return None;
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;
    let nscount = u16::from_be_bytes([data[8], data[9]]) as usize;
    let arcount = u16::from_be_bytes([data[10], data[11]]) as usize;

    let mut offset = DNS_HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(data, offset)?;
        // qtype + qclass
        offset = offset.checked_add(4)?;
        if offset > data.len() {
            return None;
        }
    }

    let mut spans = Vec::new();
    for _ in 0..ancount + nscount + arcount {
        offset = skip_name(data, offset)?;
        if offset + RR_FIXED_LEN > data.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let rdlength = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
        offset += RR_FIXED_LEN;
        if offset + rdlength > data.len() {
            return None;
        }
        if rtype == TYPE_A && rdlength == 4 {
            spans.push(offset);
        }
        offset += rdlength;
    }
    Some(spans)
}

/// Advances past a possibly-compressed DNS name starting at `offset`.
///
/// A compression pointer terminates the name, so pointers are stepped over,
/// never followed; the walk cannot loop.
fn skip_name(data: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *data.get(offset)?;
        if len == 0 {
            return Some(offset + 1);
        }
        if len & 0xc0 == 0xc0 {
            return (offset + 2 <= data.len()).then_some(offset + 2);
        }
        offset = offset.checked_add(1 + len as usize)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_name(name: &str, out: &mut Vec<u8>) {
        for label in name.trim_end_matches('.').split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    fn push_a_record(out: &mut Vec<u8>, name_offset: Option<u16>, name: &str, addr: Ipv4Addr) {
        match name_offset {
            Some(offset) => out.extend_from_slice(&(0xc000u16 | offset).to_be_bytes()),
            None => encode_name(name, out),
        }
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&0x8001u16.to_be_bytes()); // IN, cache-flush
        out.extend_from_slice(&120u32.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&addr.octets());
    }

    /// An mDNS response advertising `addr` under two names, the second via a
    /// compression pointer to the first.
    fn mdns_response(addr: Ipv4Addr) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u16.to_be_bytes()); // id (0 for mDNS)
        out.extend_from_slice(&0x8400u16.to_be_bytes()); // authoritative response
        out.extend_from_slice(&0u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&2u16.to_be_bytes()); // ancount
        out.extend_from_slice(&0u16.to_be_bytes()); // nscount
        out.extend_from_slice(&0u16.to_be_bytes()); // arcount
        push_a_record(&mut out, None, "printer.local", addr);
        push_a_record(&mut out, Some(DNS_HEADER_LEN as u16), "", addr);
        out
    }

    #[test]
    fn rewrites_every_matching_a_record() {
        let guest = Ipv4Addr::new(10, 0, 0, 5);
        let lan = Ipv4Addr::new(192, 168, 1, 5);
        let mut data = mdns_response(guest);
        let original_len = data.len();

        assert_eq!(2, translate_mdns_ip(lan, guest, &mut data));
        assert_eq!(original_len, data.len());
        assert_eq!(data, mdns_response(lan));
    }

    #[test]
    fn leaves_other_addresses_alone() {
        let mut data = mdns_response(Ipv4Addr::new(10, 0, 0, 7));
        let before = data.clone();
        assert_eq!(
            0,
            translate_mdns_ip(
                Ipv4Addr::new(192, 168, 1, 5),
                Ipv4Addr::new(10, 0, 0, 5),
                &mut data,
            ),
        );
        assert_eq!(before, data);
    }

    #[test]
    fn ignores_unspecified_guest_address() {
        let mut data = mdns_response(Ipv4Addr::UNSPECIFIED);
        let before = data.clone();
        assert_eq!(
            0,
            translate_mdns_ip(
                Ipv4Addr::new(192, 168, 1, 5),
                Ipv4Addr::UNSPECIFIED,
                &mut data,
            ),
        );
        assert_eq!(before, data);
    }

    #[test]
    fn skips_questions_before_answers() {
        let guest = Ipv4Addr::new(10, 0, 0, 5);
        let mut out = Vec::new();
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0x8400u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&1u16.to_be_bytes()); // ancount
        out.extend_from_slice(&0u32.to_be_bytes()); // nscount + arcount
        encode_name("printer.local", &mut out);
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        push_a_record(&mut out, None, "printer.local", guest);

        assert_eq!(
            1,
            translate_mdns_ip(Ipv4Addr::new(192, 168, 1, 5), guest, &mut out),
        );
    }

    #[test]
    fn tolerates_truncated_and_non_dns_payloads() {
        let lan = Ipv4Addr::new(192, 168, 1, 5);
        let guest = Ipv4Addr::new(10, 0, 0, 5);

        let mut short = vec![0u8; 4];
        assert_eq!(0, translate_mdns_ip(lan, guest, &mut short));

        // Claims one answer but ends mid-record.
        let mut truncated = mdns_response(guest);
        truncated.truncate(truncated.len() - 3);
        let before = truncated.clone();
        assert_eq!(0, translate_mdns_ip(lan, guest, &mut truncated));
        assert_eq!(before, truncated);

        let mut junk = b"M-SEARCH * HTTP/1.1\r\n".to_vec();
        let before = junk.clone();
        translate_mdns_ip(lan, guest, &mut junk);
        assert_eq!(before, junk);
    }
}
