use std::{fmt, ops};

/// Protocol version carried in version credentials.
pub const PDU_VERSION: u8 = 2;

/// Kinds of credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CredKind {
    /// Protocol version and requested connection features
    Version = 1,
    /// One step of the credential-exchange sub-protocol
    Auth    = 2,
}

impl CredKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(CredKind::Version),
            2 => Some(CredKind::Auth),
            _ => None,
        }
    }
}

/// Position of an auth credential within the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthStep {
    /// Server advertises its mechanisms
    Mechanisms = 1,
    /// Client names its choice and sends the initial response
    Start      = 2,
    /// Opaque challenge or response
    Step       = 3,
}

impl AuthStep {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(AuthStep::Mechanisms),
            2 => Some(AuthStep::Start),
            3 => Some(AuthStep::Step),
            _ => None,
        }
    }
}

/// A 4-byte tagged credential: `type:8 | a:8 | b:8 | c:8`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential(u32);

impl Credential {
    pub const fn from_parts(kind: u8, a: u8, b: u8, c: u8) -> Self {
        Credential(((kind as u32) << 24) | ((a as u32) << 16) | ((b as u32) << 8) | c as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Credential(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn kind_code(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn kind(self) -> Option<CredKind> {
        CredKind::from_u8(self.kind_code())
    }

    pub const fn a(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn b(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn c(self) -> u8 {
        self.0 as u8
    }

    /// Version credential announcing `flags`.
    pub fn version(flags: IpcFlags) -> Self {
        let bits = flags.bits() as u16;
        Self::from_parts(CredKind::Version as u8, PDU_VERSION, (bits >> 8) as u8, bits as u8)
    }

    /// Flags of a version credential.
    pub fn flags(self) -> Option<IpcFlags> {
        match self.kind() {
            Some(CredKind::Version) => {
                Some(IpcFlags::from_bits(((self.b() as u32) << 8) | self.c() as u32))
            }
            _ => None,
        }
    }

    pub fn auth(step: AuthStep) -> Self {
        Self::from_parts(CredKind::Auth as u8, step as u8, 0, 0)
    }

    pub fn auth_step(self) -> Option<AuthStep> {
        match self.kind() {
            Some(CredKind::Auth) => AuthStep::from_u8(self.a()),
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Credential(type={} a={} b={} c={})",
            self.kind_code(),
            self.a(),
            self.b(),
            self.c()
        )
    }
}

/// Connection feature bits negotiated in the first PDU of a connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IpcFlags(u32);

impl IpcFlags {
    pub const NONE: IpcFlags = IpcFlags(0);
    /// Request transport encryption
    pub const SECURE: IpcFlags = IpcFlags(1 << 0);
    /// Deprecated; always rejected
    pub const COMPRESS: IpcFlags = IpcFlags(1 << 1);
    /// Request the credential exchange
    pub const AUTH: IpcFlags = IpcFlags(1 << 2);
    /// Peer requires credentials unless the transport is trust-anchored
    pub const CREDS_REQD: IpcFlags = IpcFlags(1 << 3);
    /// Peer sends an explicit status before the encryption upgrade
    pub const SECURE_ACK: IpcFlags = IpcFlags(1 << 4);
    /// Skip security provider initialization
    pub const NO_NSS_INIT: IpcFlags = IpcFlags(1 << 5);
    /// Container name attribute present
    pub const CONTAINER: IpcFlags = IpcFlags(1 << 6);
    /// Peer requires a verifiable client certificate
    pub const CERT_REQD: IpcFlags = IpcFlags(1 << 7);

    /// Bits a server-side handshake will accept from a client.
    pub const SERVER_ACCEPTED: IpcFlags = IpcFlags(
        Self::SECURE.0
            | Self::SECURE_ACK.0
            | Self::COMPRESS.0
            | Self::AUTH.0
            | Self::CREDS_REQD.0
            | Self::CONTAINER.0
            | Self::CERT_REQD.0,
    );

    pub const fn from_bits(bits: u32) -> Self {
        IpcFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: IpcFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: IpcFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: IpcFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: IpcFlags) {
        self.0 &= !other.0;
    }

    /// Bits not present in `allowed`.
    pub const fn outside(self, allowed: IpcFlags) -> IpcFlags {
        IpcFlags(self.0 & !allowed.0)
    }
}

impl ops::BitOr for IpcFlags {
    type Output = IpcFlags;

    fn bitor(self, rhs: IpcFlags) -> IpcFlags {
        IpcFlags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for IpcFlags {
    fn bitor_assign(&mut self, rhs: IpcFlags) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for IpcFlags {
    type Output = IpcFlags;

    fn bitand(self, rhs: IpcFlags) -> IpcFlags {
        IpcFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for IpcFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(IpcFlags, &str); 8] = [
            (IpcFlags::SECURE, "SECURE"),
            (IpcFlags::COMPRESS, "COMPRESS"),
            (IpcFlags::AUTH, "AUTH"),
            (IpcFlags::CREDS_REQD, "CREDS_REQD"),
            (IpcFlags::SECURE_ACK, "SECURE_ACK"),
            (IpcFlags::NO_NSS_INIT, "NO_NSS_INIT"),
            (IpcFlags::CONTAINER, "CONTAINER"),
            (IpcFlags::CERT_REQD, "CERT_REQD"),
        ];
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.outside(IpcFlags(0xff));
        if !unknown.is_empty() {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#x}", unknown.0)?;
        }
        Ok(())
    }
}
