// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCPv4 and DHCPv6 servers answering from the cluster IPAM database.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dhcproto::{v4, v6, Decodable, Encodable};
use ipam::{Database, Family, IpamRecord, MacAddr};
use slog::{debug, info, warn, Logger};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::tftp::{self, FirmwareStore};

pub const LEASE_TIME_SECS: u32 = 5 * 60;

const V4_SERVER_PORT: u16 = 67;
const V4_CLIENT_PORT: u16 = 68;
const V6_SERVER_PORT: u16 = 547;
const V6_ALL_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// Leases from `path`. Records that do not parse are logged and skipped so
/// the remaining nodes keep getting answers.
fn load_db(log: &Logger, path: &Path) -> Result<Database> {
    let (db, bad) = ipam::load_lenient(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    for e in bad {
        warn!(log, "skipping IPAM record"; "path" => %path.display(),
            "error" => format!("{:#}", anyhow::Error::new(e)));
    }
    Ok(db)
}

fn mac_from_chaddr(chaddr: &[u8]) -> Option<MacAddr> {
    let octets: [u8; 6] = chaddr.get(..6)?.try_into().ok()?;
    Some(MacAddr::new(octets))
}

fn v4_of(ip: &IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    }
}

fn v6_of(ip: &IpAddr) -> Option<Ipv6Addr> {
    match ip {
        IpAddr::V6(v6) => Some(*v6),
        IpAddr::V4(_) => None,
    }
}

fn requested_bootfile(req: &v4::Message) -> bool {
    matches!(
        req.opts().get(v4::OptionCode::ParameterRequestList),
        Some(v4::DhcpOption::ParameterRequestList(codes))
            if codes.contains(&v4::OptionCode::BootfileName)
    )
}

/// Lease options shared by OFFER and ACK.
fn lease_v4(
    reply: &mut v4::Message,
    record: &IpamRecord,
    server_ip: Ipv4Addr,
    want_bootfile: bool,
) -> Result<()> {
    let ip = v4_of(&record.ip).context("record is not IPv4")?;
    let netmask = record
        .ipv4_netmask()
        .with_context(|| format!("bad prefix {} for {ip}", record.netmask))?;
    reply.set_yiaddr(ip);

    let opts = reply.opts_mut();
    opts.insert(v4::DhcpOption::ServerIdentifier(server_ip));
    opts.insert(v4::DhcpOption::SubnetMask(netmask));
    opts.insert(v4::DhcpOption::AddressLeaseTime(LEASE_TIME_SECS));
    if let Some(gw) = record.gateway.as_ref().and_then(v4_of) {
        opts.insert(v4::DhcpOption::Router(vec![gw]));
    }
    let dns: Vec<_> = record.nameservers.iter().filter_map(v4_of).collect();
    if !dns.is_empty() {
        opts.insert(v4::DhcpOption::DomainNameServer(dns));
    }
    if !record.hostname.is_empty() {
        opts.insert(v4::DhcpOption::Hostname(record.hostname.clone()));
    }
    if record.mtu > 0 {
        let mtu = u16::try_from(record.mtu).unwrap_or(u16::MAX);
        opts.insert(v4::DhcpOption::InterfaceMtu(mtu));
    }

    if want_bootfile {
        if let Some(server) = &record.tftp_server {
            let next = Ipv4Addr::from_str(server)
                .with_context(|| format!("bad TFTP server {server:?}"))?;
            reply.set_siaddr(next);
        }
        if let Some(file) = &record.ipxe_boot_filename {
            reply.set_fname(file.as_bytes());
            reply
                .opts_mut()
                .insert(v4::DhcpOption::BootfileName(file.as_bytes().to_vec()));
        }
    }
    Ok(())
}

/// Answer a DISCOVER or REQUEST. Returns `None` for messages this server
/// does not answer and for unknown clients.
pub fn handle_v4(
    log: &Logger,
    db: &Database,
    server_ip: Ipv4Addr,
    req: &v4::Message,
) -> Option<v4::Message> {
    let reply_type = match req.opts().msg_type()? {
        v4::MessageType::Discover => v4::MessageType::Offer,
        v4::MessageType::Request => v4::MessageType::Ack,
        other => {
            debug!(log, "ignoring DHCPv4 message"; "type" => ?other);
            return None;
        }
    };
    let mac = mac_from_chaddr(req.chaddr())?;
    let Some(record) = db.lookup(&mac, Family::V4) else {
        info!(log, "no IPv4 lease for client"; "mac" => %mac);
        return None;
    };

    let mut reply = v4::Message::default();
    reply
        .set_opcode(v4::Opcode::BootReply)
        .set_htype(req.htype())
        .set_xid(req.xid())
        .set_flags(req.flags())
        .set_giaddr(req.giaddr())
        .set_chaddr(req.chaddr());
    reply.opts_mut().insert(v4::DhcpOption::MessageType(reply_type));

    if let Err(e) = lease_v4(&mut reply, record, server_ip, requested_bootfile(req)) {
        warn!(log, "bad IPAM record"; "mac" => %mac, "error" => %e);
        return None;
    }
    info!(log, "DHCPv4 reply";
        "mac" => %mac, "type" => ?reply_type, "ip" => %record.ip);
    Some(reply)
}

/// Hardware address carried by a DUID-LLT (type 1) or DUID-LL (type 3).
pub fn mac_from_duid(duid: &[u8]) -> Option<MacAddr> {
    let kind = u16::from_be_bytes(duid.get(..2)?.try_into().ok()?);
    let hw = match kind {
        1 => duid.get(8..14)?,
        3 => duid.get(4..10)?,
        _ => return None,
    };
    mac_from_chaddr(hw)
}

/// DUID-LL of the server built from its interface address.
pub fn server_duid(mac: &MacAddr) -> Vec<u8> {
    let mut duid = vec![0, 3, 0, 1];
    duid.extend_from_slice(&mac.octets());
    duid
}

/// Answer SOLICIT with ADVERTISE and REQUEST/RENEW/REBIND with REPLY.
pub fn handle_v6(
    log: &Logger,
    db: &Database,
    server_duid: &[u8],
    req: &v6::Message,
) -> Option<v6::Message> {
    let reply_type = match req.msg_type() {
        v6::MessageType::Solicit => v6::MessageType::Advertise,
        v6::MessageType::Request
        | v6::MessageType::Renew
        | v6::MessageType::Rebind => v6::MessageType::Reply,
        other => {
            debug!(log, "ignoring DHCPv6 message"; "type" => ?other);
            return None;
        }
    };
    let Some(v6::DhcpOption::ClientId(client_id)) =
        req.opts().get(v6::OptionCode::ClientId)
    else {
        debug!(log, "DHCPv6 message without client id");
        return None;
    };
    let mac = mac_from_duid(client_id)?;
    let Some(record) = db.lookup(&mac, Family::V6) else {
        info!(log, "no IPv6 lease for client"; "mac" => %mac);
        return None;
    };
    let addr = v6_of(&record.ip)?;
    let iaid = match req.opts().get(v6::OptionCode::IANA) {
        Some(v6::DhcpOption::IANA(iana)) => iana.id,
        _ => 0,
    };

    let mut reply = v6::Message::new_with_id(reply_type, req.xid());
    let opts = reply.opts_mut();
    opts.insert(v6::DhcpOption::ClientId(client_id.clone()));
    opts.insert(v6::DhcpOption::ServerId(server_duid.to_vec()));

    let mut ia_opts = v6::DhcpOptions::new();
    ia_opts.insert(v6::DhcpOption::IAAddr(v6::IAAddr {
        addr,
        preferred_life: LEASE_TIME_SECS,
        valid_life: LEASE_TIME_SECS,
        opts: v6::DhcpOptions::new(),
    }));
    opts.insert(v6::DhcpOption::IANA(v6::IANA {
        id: iaid,
        t1: LEASE_TIME_SECS / 2,
        t2: LEASE_TIME_SECS * 4 / 5,
        opts: ia_opts,
    }));
    let dns: Vec<_> = record.nameservers.iter().filter_map(v6_of).collect();
    if !dns.is_empty() {
        opts.insert(v6::DhcpOption::DomainNameServers(dns));
    }
    info!(log, "DHCPv6 reply"; "mac" => %mac, "type" => ?reply_type, "ip" => %addr);
    Some(reply)
}

/// Parameters of `dhcpd-launch`.
#[derive(Clone, Debug)]
pub struct DhcpdConfig {
    pub state_path: PathBuf,
    pub addrs: Vec<IpAddr>,
    pub interface: String,
}

fn bound_socket(domain: Domain, addr: SocketAddr, iface: &str) -> Result<UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if domain == Domain::IPV4 {
        socket.set_broadcast(true)?;
    } else {
        socket.set_only_v6(true)?;
    }
    socket
        .bind_device(Some(iface.as_bytes()))
        .with_context(|| format!("failed to bind to device {iface}"))?;
    socket.bind(&addr.into()).with_context(|| format!("failed to bind {addr}"))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn interface_index(iface: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{iface}/ifindex");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {path}"))?;
    Ok(raw.trim().parse()?)
}

fn interface_mac(iface: &str) -> Result<MacAddr> {
    let path = format!("/sys/class/net/{iface}/address");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {path}"))?;
    Ok(raw.trim().parse()?)
}

/// Turn off TX checksum offload on the bridge: locally generated replies
/// would otherwise leave with unfinished checksums.
pub async fn disable_tx_offload(iface: &str) -> Result<()> {
    crate::process::run("ethtool", ["-K", iface, "tx", "off"]).await.map(drop)
}

pub async fn serve_v4(
    log: Logger,
    cfg: DhcpdConfig,
    server_ip: Ipv4Addr,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = bound_socket(
        Domain::IPV4,
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), V4_SERVER_PORT),
        &cfg.interface,
    )?;
    info!(log, "DHCPv4 server listening"; "interface" => &cfg.interface);
    let db_path = cfg.state_path.join(ipam::DB_FILE);

    let mut buf = vec![0u8; 1500];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = socket.recv_from(&mut buf) => res.context("DHCPv4 receive")?,
        };
        let req = match v4::Message::from_bytes(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!(log, "malformed DHCPv4 packet"; "peer" => %peer, "error" => %e);
                continue;
            }
        };
        let db = match load_db(&log, &db_path) {
            Ok(db) => db,
            Err(e) => {
                warn!(log, "IPAM load failed"; "error" => %e);
                continue;
            }
        };
        let Some(reply) = handle_v4(&log, &db, server_ip, &req) else {
            continue;
        };
        let dest = if req.ciaddr().is_unspecified() {
            SocketAddr::new(Ipv4Addr::BROADCAST.into(), V4_CLIENT_PORT)
        } else {
            SocketAddr::new(req.ciaddr().into(), V4_CLIENT_PORT)
        };
        match reply.to_vec() {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, dest).await {
                    warn!(log, "DHCPv4 send failed"; "dest" => %dest, "error" => %e);
                }
            }
            Err(e) => warn!(log, "DHCPv4 encode failed"; "error" => %e),
        }
    }
}

pub async fn serve_v6(
    log: Logger,
    cfg: DhcpdConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = bound_socket(
        Domain::IPV6,
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, V6_SERVER_PORT, 0, 0)),
        &cfg.interface,
    )?;
    let index = interface_index(&cfg.interface)?;
    socket
        .join_multicast_v6(&V6_ALL_SERVERS, index)
        .context("failed to join DHCPv6 multicast group")?;
    let duid = match interface_mac(&cfg.interface) {
        Ok(mac) => server_duid(&mac),
        Err(e) => {
            warn!(log, "using random server DUID"; "error" => %e);
            server_duid(&MacAddr::random_local())
        }
    };
    info!(log, "DHCPv6 server listening"; "interface" => &cfg.interface);
    let db_path = cfg.state_path.join(ipam::DB_FILE);

    let mut buf = vec![0u8; 1500];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = socket.recv_from(&mut buf) => res.context("DHCPv6 receive")?,
        };
        let req = match v6::Message::from_bytes(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!(log, "malformed DHCPv6 packet"; "peer" => %peer, "error" => %e);
                continue;
            }
        };
        let db = match load_db(&log, &db_path) {
            Ok(db) => db,
            Err(e) => {
                warn!(log, "IPAM load failed"; "error" => %e);
                continue;
            }
        };
        let Some(reply) = handle_v6(&log, &db, &duid, &req) else {
            continue;
        };
        match reply.to_vec() {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, peer).await {
                    warn!(log, "DHCPv6 send failed"; "peer" => %peer, "error" => %e);
                }
            }
            Err(e) => warn!(log, "DHCPv6 encode failed"; "error" => %e),
        }
    }
}

/// Everything `dhcpd-launch` runs: a DHCPv4 server per IPv4 address, a
/// DHCPv6 server when any address is IPv6, and a TFTP server for iPXE
/// images when a next-stage handler is set.
pub async fn run(
    log: Logger,
    cfg: DhcpdConfig,
    tftp: Option<Arc<FirmwareStore>>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(e) = disable_tx_offload(&cfg.interface).await {
        warn!(log, "failed to disable TX offload"; "interface" => &cfg.interface, "error" => %e);
    }

    let mut tasks = JoinSet::new();
    for addr in &cfg.addrs {
        match addr {
            IpAddr::V4(v4) => {
                let log = log.new(slog::o!("proto" => "dhcpv4"));
                tasks.spawn(serve_v4(log, cfg.clone(), *v4, cancel.clone()));
            }
            IpAddr::V6(_) => {}
        }
        if let Some(store) = &tftp {
            let log = log.new(slog::o!("proto" => "tftp"));
            let bind = SocketAddr::new(*addr, tftp::PORT);
            tasks.spawn(tftp::serve(log, bind, store.clone(), cancel.clone()));
        }
    }
    if cfg.addrs.iter().any(IpAddr::is_ipv6) {
        let log = log.new(slog::o!("proto" => "dhcpv6"));
        tasks.spawn(serve_v6(log, cfg.clone(), cancel.clone()));
    }

    // The first server to fail takes the others down.
    while let Some(res) = tasks.join_next().await {
        let res = res.context("DHCP task panicked").and_then(|r| r);
        if res.is_err() {
            cancel.cancel();
            return res;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const MAC: MacAddr = MacAddr::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

    fn db() -> Database {
        let mut db = Database::default();
        db.insert(IpamRecord {
            ip: "10.5.0.2".parse().unwrap(),
            netmask: 24,
            mac: MAC,
            hostname: "cp0".to_string(),
            gateway: Some("10.5.0.1".parse().unwrap()),
            mtu: 1500,
            nameservers: vec!["10.5.0.1".parse().unwrap(), "fd00::1".parse().unwrap()],
            tftp_server: Some("10.5.0.1".to_string()),
            ipxe_boot_filename: Some("ipxe/amd64/snp.efi".to_string()),
        });
        db.insert(IpamRecord {
            ip: "fd00::2".parse().unwrap(),
            netmask: 64,
            mac: MAC,
            hostname: "cp0".to_string(),
            gateway: Some("fd00::1".parse().unwrap()),
            mtu: 1500,
            nameservers: vec!["10.5.0.1".parse().unwrap(), "fd00::1".parse().unwrap()],
            tftp_server: None,
            ipxe_boot_filename: None,
        });
        db
    }

    fn discover(mac: MacAddr, prl: Vec<v4::OptionCode>) -> v4::Message {
        let mut msg = v4::Message::default();
        msg.set_xid(0x1234).set_chaddr(&mac.octets());
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
        msg.opts_mut().insert(v4::DhcpOption::ParameterRequestList(prl));
        msg
    }

    #[test]
    fn offer_carries_lease_and_pxe_fields() {
        let req = discover(
            MAC,
            vec![v4::OptionCode::SubnetMask, v4::OptionCode::BootfileName],
        );
        let server = Ipv4Addr::new(10, 5, 0, 1);
        let reply = handle_v4(&crate::test_logger(), &db(), server, &req).unwrap();

        // Survives the wire.
        let reply = v4::Message::from_bytes(&reply.to_vec().unwrap()).unwrap();
        assert_eq!(reply.opts().msg_type(), Some(v4::MessageType::Offer));
        assert_eq!(reply.xid(), 0x1234);
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 5, 0, 2));
        assert_eq!(reply.siaddr(), server);
        assert_eq!(
            reply.opts().get(v4::OptionCode::SubnetMask),
            Some(&v4::DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
        );
        assert_eq!(
            reply.opts().get(v4::OptionCode::Router),
            Some(&v4::DhcpOption::Router(vec![server]))
        );
        assert_eq!(
            reply.opts().get(v4::OptionCode::DomainNameServer),
            Some(&v4::DhcpOption::DomainNameServer(vec![server]))
        );
        assert_eq!(
            reply.opts().get(v4::OptionCode::BootfileName),
            Some(&v4::DhcpOption::BootfileName(b"ipxe/amd64/snp.efi".to_vec()))
        );
        assert_eq!(
            reply.opts().get(v4::OptionCode::AddressLeaseTime),
            Some(&v4::DhcpOption::AddressLeaseTime(300))
        );
    }

    #[test]
    fn no_bootfile_unless_requested() {
        let req = discover(MAC, vec![v4::OptionCode::SubnetMask]);
        let reply =
            handle_v4(&crate::test_logger(), &db(), Ipv4Addr::new(10, 5, 0, 1), &req)
                .unwrap();
        assert!(reply.opts().get(v4::OptionCode::BootfileName).is_none());
        assert_eq!(reply.siaddr(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn torn_ipam_line_does_not_block_leases() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ipam::DB_FILE);
        let mut record = IpamRecord {
            ip: "10.5.0.3".parse().unwrap(),
            netmask: 24,
            mac: MacAddr::new([2, 0, 0, 0, 0, 9]),
            hostname: "w0".to_string(),
            gateway: Some("10.5.0.1".parse().unwrap()),
            mtu: 1500,
            nameservers: vec![],
            tftp_server: None,
            ipxe_boot_filename: None,
        };
        ipam::append(&path, &record).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"ip\": \"10.5.\n")
            .unwrap();
        record.ip = "10.5.0.2".parse().unwrap();
        record.mac = MAC;
        ipam::append(&path, &record).unwrap();

        let db = load_db(&crate::test_logger(), &path).unwrap();
        assert_eq!(db.len(), 2);
        let req = discover(MAC, vec![]);
        let reply =
            handle_v4(&crate::test_logger(), &db, Ipv4Addr::new(10, 5, 0, 1), &req)
                .unwrap();
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 5, 0, 2));
    }

    #[test]
    fn unknown_mac_is_dropped() {
        let other = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let req = discover(other, vec![]);
        assert!(handle_v4(
            &crate::test_logger(),
            &db(),
            Ipv4Addr::new(10, 5, 0, 1),
            &req
        )
        .is_none());
    }

    #[test]
    fn duid_macs() {
        let llt = [0, 1, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        assert_eq!(mac_from_duid(&llt), Some(MAC));
        let ll = [0, 3, 0, 1, 0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        assert_eq!(mac_from_duid(&ll), Some(MAC));
        assert_eq!(mac_from_duid(&[0, 2, 0, 0]), None);
        assert_eq!(server_duid(&MAC), ll);
    }

    #[test]
    fn solicit_gets_advertise() {
        let mut req = v6::Message::new(v6::MessageType::Solicit);
        req.opts_mut()
            .insert(v6::DhcpOption::ClientId(vec![0, 3, 0, 1, 0x52, 0x54, 0, 0x12, 0x34, 0x56]));
        req.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
            id: 7,
            t1: 0,
            t2: 0,
            opts: v6::DhcpOptions::new(),
        }));
        let duid = server_duid(&MacAddr::new([2, 0, 0, 0, 0, 9]));
        let reply = handle_v6(&crate::test_logger(), &db(), &duid, &req).unwrap();
        assert_eq!(reply.msg_type(), v6::MessageType::Advertise);
        assert_eq!(reply.xid(), req.xid());

        let Some(v6::DhcpOption::IANA(iana)) = reply.opts().get(v6::OptionCode::IANA)
        else {
            panic!("no IA_NA");
        };
        assert_eq!(iana.id, 7);
        let Some(v6::DhcpOption::IAAddr(addr)) =
            iana.opts.get(v6::OptionCode::IAAddr)
        else {
            panic!("no IA address");
        };
        assert_eq!(addr.addr, "fd00::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            reply.opts().get(v6::OptionCode::DomainNameServers),
            Some(&v6::DhcpOption::DomainNameServers(vec!["fd00::1".parse().unwrap()]))
        );
        assert_eq!(
            reply.opts().get(v6::OptionCode::ServerId),
            Some(&v6::DhcpOption::ServerId(duid))
        );
    }
}
