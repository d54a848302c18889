use std::fmt;

// Metric identifier layout, most significant bit first:
//   flag:1 | domain:9 | cluster:12 | item:10
const PMID_ITEM_BITS: u32 = 10;
const PMID_CLUSTER_BITS: u32 = 12;
const PMID_DOMAIN_BITS: u32 = 9;

// Instance domain layout:
//   flag:1 | domain:9 | serial:22
const INDOM_SERIAL_BITS: u32 = 22;
const INDOM_DOMAIN_BITS: u32 = 9;

const fn mask(bits: u32) -> u32 {
    (1 << bits) - 1
}

/// Metric identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PmId(u32);

impl PmId {
    pub const NULL: PmId = PmId(u32::MAX);

    /// Builds an identifier; out-of-range components are masked.
    pub const fn new(domain: u32, cluster: u32, item: u32) -> Self {
        let domain = domain & mask(PMID_DOMAIN_BITS);
        let cluster = cluster & mask(PMID_CLUSTER_BITS);
        let item = item & mask(PMID_ITEM_BITS);
        PmId((domain << (PMID_CLUSTER_BITS + PMID_ITEM_BITS)) | (cluster << PMID_ITEM_BITS) | item)
    }

    pub const fn from_raw(raw: u32) -> Self {
        PmId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn domain(self) -> u32 {
        (self.0 >> (PMID_CLUSTER_BITS + PMID_ITEM_BITS)) & mask(PMID_DOMAIN_BITS)
    }

    pub const fn cluster(self) -> u32 {
        (self.0 >> PMID_ITEM_BITS) & mask(PMID_CLUSTER_BITS)
    }

    pub const fn item(self) -> u32 {
        self.0 & mask(PMID_ITEM_BITS)
    }
}

impl fmt::Display for PmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == PmId::NULL {
            return f.write_str("PM_ID_NULL");
        }
        write!(f, "{}.{}.{}", self.domain(), self.cluster(), self.item())
    }
}

/// Instance domain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InDom(u32);

impl InDom {
    pub const NULL: InDom = InDom(u32::MAX);

    pub const fn new(domain: u32, serial: u32) -> Self {
        let domain = domain & mask(INDOM_DOMAIN_BITS);
        let serial = serial & mask(INDOM_SERIAL_BITS);
        InDom((domain << INDOM_SERIAL_BITS) | serial)
    }

    pub const fn from_raw(raw: u32) -> Self {
        InDom(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn domain(self) -> u32 {
        (self.0 >> INDOM_SERIAL_BITS) & mask(INDOM_DOMAIN_BITS)
    }

    pub const fn serial(self) -> u32 {
        self.0 & mask(INDOM_SERIAL_BITS)
    }
}

impl fmt::Display for InDom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == InDom::NULL {
            return f.write_str("PM_INDOM_NULL");
        }
        write!(f, "{}.{}", self.domain(), self.serial())
    }
}

/// Connection information advertised by a collector in the datum of its
/// first ERROR PDU.
///
/// Layout: `zero:1 | version:7 | licensed:8 | features:16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduInfo(u32);

impl PduInfo {
    pub const fn new(version: u8, licensed: u8, features: u16) -> Self {
        PduInfo((((version & 0x7f) as u32) << 24) | ((licensed as u32) << 16) | features as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        PduInfo(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn version(self) -> u8 {
        ((self.0 >> 24) & 0x7f) as u8
    }

    pub const fn licensed(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub const fn features(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}
