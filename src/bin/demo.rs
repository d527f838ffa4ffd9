//! Demo binary
//!
//! Runs a few flows through one aliasing instance and checks every
//! translated packet with smoltcp's wire parsers. Pass a TOML file to
//! override the default configuration.

use std::net::Ipv4Addr;

use alias_core::{AliasConfig, AliasError, PacketAlias, Status, TransportProtocol};
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket, TcpSeqNumber, UdpPacket,
};

const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 80);
const REMOTE: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const ALIAS: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cannot load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => AliasConfig::new(ALIAS),
    };
    let mut alias = PacketAlias::new(config);

    println!("=== Alias Core Demo ===\n");

    // Demo 1: UDP request and reply
    demo_udp_round_trip(&mut alias);

    // Demo 2: FTP PORT command rewrite
    demo_ftp_port(&mut alias);

    // Demo 3: Inbound port redirect
    demo_port_redirect(&mut alias);

    println!("--- Link statistics ---");
    println!("  {:?}", alias.stats());

    println!("\n=== Demo Complete ===");
}

fn load_config(path: &str) -> alias_core::Result<AliasConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| AliasError::Config(e.to_string()))?;
    AliasConfig::from_toml_str(&text)
}

fn demo_udp_round_trip(alias: &mut PacketAlias) {
    println!("--- Demo 1: UDP round trip ---");
    let alias_addr = alias.default_alias_address();

    let mut query = udp_packet(HOST, 5353, REMOTE, 53, b"example query");
    let status = alias.translate_outbound(&mut query, 1500);
    report("outbound", status, &query);

    let alias_port = udp_ports(&query).0;
    let mut answer = udp_packet(REMOTE, 53, alias_addr, alias_port, b"example answer");
    let status = alias.translate_inbound(&mut answer, 1500);
    report("inbound", status, &answer);
    println!();
}

fn demo_ftp_port(alias: &mut PacketAlias) {
    println!("--- Demo 2: FTP PORT ---");
    let ftp_server = Ipv4Addr::new(198, 51, 100, 21);

    let mut syn = tcp_packet(HOST, 40000, ftp_server, 21, 1, b"", true);
    report("SYN", alias.translate_outbound(&mut syn, 1500), &syn);

    let command = b"PORT 10,0,0,5,19,137\r\n";
    let mut port = tcp_packet(HOST, 40000, ftp_server, 21, 2, command, false);
    port.resize(1500, 0);
    let status = alias.translate_outbound(&mut port, 1500);
    let len = Ipv4Packet::new_unchecked(&port[..]).total_len() as usize;
    port.truncate(len);
    report("PORT", status, &port);

    if let Ok(ip) = Ipv4Packet::new_checked(&port[..]) {
        if let Ok(tcp) = TcpPacket::new_checked(ip.payload()) {
            println!("    payload: {:?}", String::from_utf8_lossy(tcp.payload()));
        }
    }
    println!();
}

fn demo_port_redirect(alias: &mut PacketAlias) {
    println!("--- Demo 3: Port redirect ---");
    let alias_addr = alias.default_alias_address();

    match alias.redirect_port(
        SERVER,
        8080,
        Ipv4Addr::UNSPECIFIED,
        0,
        alias_addr,
        80,
        TransportProtocol::Tcp,
    ) {
        Ok(_) => println!("  {}:80 -> {}:8080", alias_addr, SERVER),
        Err(e) => {
            println!("  redirect failed: {}", e);
            return;
        }
    }

    let mut syn = tcp_packet(REMOTE, 5555, alias_addr, 80, 1, b"", true);
    report("inbound SYN", alias.translate_inbound(&mut syn, 1500), &syn);
    println!();
}

/// Print the status and the checksum verdict of a translated packet
fn report(label: &str, status: Status, packet: &[u8]) {
    let ip = match Ipv4Packet::new_checked(packet) {
        Ok(ip) => ip,
        Err(e) => {
            println!("  {}: {:?}, unparsable: {}", label, status, e);
            return;
        }
    };
    let src = IpAddress::Ipv4(ip.src_addr());
    let dst = IpAddress::Ipv4(ip.dst_addr());
    let transport_ok = match ip.next_header() {
        IpProtocol::Tcp => TcpPacket::new_checked(ip.payload())
            .map(|tcp| tcp.verify_checksum(&src, &dst))
            .unwrap_or(false),
        IpProtocol::Udp => UdpPacket::new_checked(ip.payload())
            .map(|udp| udp.verify_checksum(&src, &dst))
            .unwrap_or(false),
        _ => true,
    };
    println!(
        "  {}: {:?} {} -> {} (ip checksum {}, transport checksum {})",
        label,
        status,
        ip.src_addr(),
        ip.dst_addr(),
        verdict(ip.verify_checksum()),
        verdict(transport_ok)
    );
}

fn verdict(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "BAD"
    }
}

fn udp_ports(packet: &[u8]) -> (u16, u16) {
    let ip = Ipv4Packet::new_unchecked(packet);
    let udp = UdpPacket::new_unchecked(ip.payload());
    (udp.src_port(), udp.dst_port())
}

fn wire(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&addr.octets())
}

fn ipv4_header(packet: &mut [u8], protocol: IpProtocol, src: Ipv4Addr, dst: Ipv4Addr) {
    let total = packet.len() as u16;
    let mut ip = Ipv4Packet::new_unchecked(packet);
    ip.set_version(4);
    ip.set_header_len(20);
    ip.set_total_len(total);
    ip.set_ident(0x1234);
    ip.clear_flags();
    ip.set_hop_limit(64);
    ip.set_next_header(protocol);
    ip.set_src_addr(wire(src));
    ip.set_dst_addr(wire(dst));
    ip.fill_checksum();
}

fn udp_packet(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 28 + payload.len()];
    ipv4_header(&mut packet, IpProtocol::Udp, src, dst);
    let mut udp = UdpPacket::new_unchecked(&mut packet[20..]);
    udp.set_src_port(sport);
    udp.set_dst_port(dport);
    udp.set_len((8 + payload.len()) as u16);
    udp.payload_mut().copy_from_slice(payload);
    udp.fill_checksum(&IpAddress::Ipv4(wire(src)), &IpAddress::Ipv4(wire(dst)));
    packet
}

fn tcp_packet(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    seq: i32,
    payload: &[u8],
    syn: bool,
) -> Vec<u8> {
    let mut packet = vec![0u8; 40 + payload.len()];
    ipv4_header(&mut packet, IpProtocol::Tcp, src, dst);
    let mut tcp = TcpPacket::new_unchecked(&mut packet[20..]);
    tcp.set_src_port(sport);
    tcp.set_dst_port(dport);
    tcp.set_seq_number(TcpSeqNumber(seq));
    tcp.set_header_len(20);
    tcp.clear_flags();
    tcp.set_syn(syn);
    tcp.set_ack(!syn);
    tcp.set_psh(!payload.is_empty());
    tcp.set_window_len(8192);
    tcp.payload_mut().copy_from_slice(payload);
    tcp.fill_checksum(&IpAddress::Ipv4(wire(src)), &IpAddress::Ipv4(wire(dst)));
    packet
}
