// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MAC-keyed address reservation database.
//!
//! The database is a file of newline-delimited JSON records which is only
//! ever appended to. Launchers append one record per leased address when
//! they attach a VM to the cluster network, and the DHCP servers re-read the
//! whole file on every request. Records are merged by (MAC, address family)
//! on load, with the most recently appended record winning.

use std::collections::HashMap;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// File name of the database inside a cluster state directory.
pub const DB_FILE: &str = "ipam.db";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to access IPAM database {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed IPAM record on line {line}")]
    Record {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode IPAM record")]
    Encode(#[source] serde_json::Error),

    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
}

/// A 48-bit Ethernet hardware address. Supports conversion from a string
/// formatted as colon-separated hex octets, e.g. "52:54:00:12:34:56".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// A random unicast, locally administered address.
    pub fn random_local() -> Self {
        let mut octets = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut octets);
        octets[0] = (octets[0] & !1) | 2;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Upper-case rendering used by remote hypervisor APIs.
    pub fn to_upper_string(&self) -> String {
        self.to_string().to_uppercase()
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split([':', '-']) {
            if count == octets.len() || part.len() != 2 {
                return Err(Error::InvalidMac(s.to_string()));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidMac(s.to_string()))?;
            count += 1;
        }
        if count != octets.len() {
            return Err(Error::InvalidMac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// Address family of a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// One address lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamRecord {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    /// Prefix length of the network the address was leased from.
    #[serde(rename = "Netmask")]
    pub netmask: u8,
    #[serde(rename = "MAC")]
    pub mac: MacAddr,
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Gateway", default)]
    pub gateway: Option<IpAddr>,
    #[serde(rename = "MTU", default)]
    pub mtu: u32,
    #[serde(rename = "Nameservers", default)]
    pub nameservers: Vec<IpAddr>,
    #[serde(rename = "TFTPServer", default)]
    pub tftp_server: Option<String>,
    #[serde(rename = "IPXEBootFilename", default)]
    pub ipxe_boot_filename: Option<String>,
}

impl IpamRecord {
    pub fn family(&self) -> Family {
        Family::of(&self.ip)
    }

    /// The leased address together with its prefix.
    pub fn network(&self) -> Option<IpNetwork> {
        IpNetwork::new(self.ip, self.netmask).ok()
    }

    /// Dotted-quad netmask of an IPv4 lease.
    pub fn ipv4_netmask(&self) -> Option<Ipv4Addr> {
        match self.network()? {
            IpNetwork::V4(n) => Some(n.mask()),
            IpNetwork::V6(_) => None,
        }
    }
}

/// Loaded database contents, keyed by MAC then address family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Database {
    records: HashMap<MacAddr, HashMap<Family, IpamRecord>>,
}

impl Database {
    pub fn insert(&mut self, record: IpamRecord) {
        self.records
            .entry(record.mac)
            .or_default()
            .insert(record.family(), record);
    }

    pub fn lookup(&self, mac: &MacAddr, family: Family) -> Option<&IpamRecord> {
        self.records.get(mac)?.get(&family)
    }

    pub fn len(&self) -> usize {
        self.records.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpamRecord> {
        self.records.values().flat_map(HashMap::values)
    }
}

/// Append `record` to the database at `path`, creating it if needed.
///
/// The encoded record and its terminating newline are handed to a single
/// `write` on a file opened in append mode.
pub fn append(path: &Path, record: &IpamRecord) -> Result<(), Error> {
    let mut line = serde_json::to_vec(record).map_err(Error::Encode)?;
    line.push(b'\n');

    let io_err = |source| Error::Io { path: path.to_path_buf(), source };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(&line).map_err(io_err)
}

/// Load the database at `path`. A missing file is an empty database.
pub fn load(path: &Path) -> Result<Database, Error> {
    let (db, mut bad) = read(path, false)?;
    match bad.pop() {
        Some(e) => Err(e),
        None => Ok(db),
    }
}

/// Like [`load`], but records that fail to parse (a torn final write, a
/// hand edit) are skipped and returned next to the database.
pub fn load_lenient(path: &Path) -> Result<(Database, Vec<Error>), Error> {
    read(path, true)
}

/// Stops at the first bad record unless `skip_bad` is set.
fn read(path: &Path, skip_bad: bool) -> Result<(Database, Vec<Error>), Error> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok((Database::default(), Vec::new()))
        }
        Err(source) => {
            return Err(Error::Io { path: path.to_path_buf(), source })
        }
    };

    let mut db = Database::default();
    let mut bad = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => db.insert(record),
            Err(source) => {
                bad.push(Error::Record { line: idx + 1, source });
                if !skip_bad {
                    break;
                }
            }
        }
    }
    Ok((db, bad))
}

#[cfg(test)]
mod test {
    use super::*;

    use proptest::prelude::*;

    fn record(mac: &str, ip: &str, hostname: &str) -> IpamRecord {
        IpamRecord {
            ip: ip.parse().unwrap(),
            netmask: 24,
            mac: mac.parse().unwrap(),
            hostname: hostname.to_string(),
            gateway: Some("10.5.0.1".parse().unwrap()),
            mtu: 1500,
            nameservers: vec!["10.5.0.1".parse().unwrap()],
            tftp_server: None,
            ipxe_boot_filename: None,
        }
    }

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "52:54:00:AB:cd:0e".parse().unwrap();
        assert_eq!(mac.to_string(), "52:54:00:ab:cd:0e");
        assert_eq!(mac.to_upper_string(), "52:54:00:AB:CD:0E");
        assert!("52:54:00:ab:cd".parse::<MacAddr>().is_err());
        assert!("52:54:00:ab:cd:0e:ff".parse::<MacAddr>().is_err());
        assert!("zz:54:00:ab:cd:0e".parse::<MacAddr>().is_err());
    }

    #[test]
    fn random_mac_is_local_unicast() {
        for _ in 0..32 {
            let octets = MacAddr::random_local().octets();
            assert_eq!(octets[0] & 1, 0);
            assert_eq!(octets[0] & 2, 2);
        }
    }

    #[test]
    fn wire_field_names() {
        let json = serde_json::to_value(record(
            "52:54:00:00:00:01",
            "10.5.0.2",
            "cp0",
        ))
        .unwrap();
        for key in [
            "IP",
            "Netmask",
            "MAC",
            "Hostname",
            "Gateway",
            "MTU",
            "Nameservers",
            "TFTPServer",
            "IPXEBootFilename",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn missing_db_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = load(&dir.path().join(DB_FILE)).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn families_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE);
        let mac = "52:54:00:00:00:01";
        append(&path, &record(mac, "10.5.0.2", "cp0")).unwrap();
        let mut v6 = record(mac, "fd00::2", "cp0");
        v6.netmask = 64;
        append(&path, &v6).unwrap();

        let db = load(&path).unwrap();
        let mac = mac.parse().unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(
            db.lookup(&mac, Family::V4).unwrap().ip,
            "10.5.0.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(db.lookup(&mac, Family::V6).unwrap().netmask, 64);
    }

    #[test]
    fn ipv4_netmask_from_prefix() {
        let r = record("52:54:00:00:00:01", "10.5.0.2", "cp0");
        assert_eq!(r.ipv4_netmask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
    }

    #[test]
    fn malformed_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE);
        append(&path, &record("52:54:00:00:00:01", "10.5.0.2", "cp0"))
            .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        assert!(matches!(load(&path), Err(Error::Record { line: 2, .. })));

        append(&path, &record("52:54:00:00:00:02", "10.5.0.3", "w0"))
            .unwrap();
        let (db, bad) = load_lenient(&path).unwrap();
        assert!(matches!(bad[..], [Error::Record { line: 2, .. }]));
        assert_eq!(db.len(), 2);
    }

    proptest! {
        #[test]
        fn last_append_wins(writes in prop::collection::vec((0u8..4, 0u8..=255), 1..40)) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join(DB_FILE);
            let mut expected = HashMap::new();
            for (i, (mac, host)) in writes.iter().enumerate() {
                let mac = format!("52:54:00:00:00:{mac:02x}");
                let mut r = record(&mac, &format!("10.5.0.{host}"), "n");
                r.hostname = format!("write-{i}");
                append(&path, &r).unwrap();
                expected.insert(r.mac, r);
            }
            let db = load(&path).unwrap();
            prop_assert_eq!(db.len(), expected.len());
            for (mac, r) in expected {
                prop_assert_eq!(db.lookup(&mac, Family::V4), Some(&r));
            }
        }
    }
}
