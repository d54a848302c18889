use bytes::Bytes;

use super::{
    creds::Credential,
    ident::{InDom, PmId},
    wire::{padded, PduReader, PduWriter},
    DecodeError, PduFrame, PduType,
};

/// Width of a value slot in a result's value list.
///
/// A slot holds either an in-situ 32-bit value or the word offset of a
/// value block. Both layouts are explicit fixed-width encodings; which one
/// [`Pdu::encode`] and [`Pdu::decode`] use is fixed when the crate is
/// built, from the target's word size. Peers built for the other word size
/// are served with [`Pdu::encode_with`] and [`Pdu::decode_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWidth {
    /// 32-bit slots
    Narrow,
    /// 64-bit slots
    Wide,
}

impl SlotWidth {
    /// Encoding used by [`Pdu::encode`] and [`Pdu::decode`].
    #[cfg(target_pointer_width = "64")]
    pub const WIRE: SlotWidth = SlotWidth::Wide;
    /// Encoding used by [`Pdu::encode`] and [`Pdu::decode`].
    #[cfg(not(target_pointer_width = "64"))]
    pub const WIRE: SlotWidth = SlotWidth::Narrow;

    fn bytes(self) -> usize {
        match self {
            SlotWidth::Narrow => 4,
            SlotWidth::Wide => 8,
        }
    }
}

impl Default for SlotWidth {
    fn default() -> Self {
        SlotWidth::WIRE
    }
}

const VALFMT_INSITU: i32 = 0;
const VALFMT_DPTR: i32 = 1;
const VALFMT_SPTR: i32 = 2;

/// Seconds and microseconds, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeval {
    pub sec:  i32,
    pub usec: i32,
}

/// ERROR payload. Collectors set `datum` on the first PDU of a connection
/// to advertise their features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPdu {
    pub code:  i32,
    pub datum: Option<i32>,
}

/// A value stored directly in its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsituValue {
    pub inst:  i32,
    pub value: i32,
}

/// Out-of-line value: type tag plus raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBlock {
    pub vtype: u8,
    pub data:  Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockValue {
    pub inst:  i32,
    pub block: ValueBlock,
}

/// Values of one metric. Either every value is in-situ or every value is a
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueList {
    Insitu(Vec<InsituValue>),
    Blocks(Vec<BlockValue>),
}

impl ValueList {
    pub fn len(&self) -> usize {
        match self {
            ValueList::Insitu(v) => v.len(),
            ValueList::Blocks(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One metric's worth of a result. A negative `status` reports a per-metric
/// error and carries no values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSet {
    pub pmid:   PmId,
    pub status: i32,
    pub values: ValueList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmResult {
    pub timestamp: Timeval,
    pub sets:      Vec<ValueSet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDomProfile {
    pub indom:     InDom,
    pub state:     i32,
    pub instances: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub ctx:      i32,
    pub state:    i32,
    pub profiles: Vec<InDomProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReq {
    pub ctx:   i32,
    pub when:  Timeval,
    pub pmids: Vec<PmId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc {
    pub pmid:  PmId,
    pub vtype: i32,
    pub indom: InDom,
    pub sem:   i32,
    pub units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReq {
    pub when:  Timeval,
    pub indom: InDom,
    pub inst:  i32,
    pub name:  Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEntry {
    pub inst: i32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceResult {
    pub indom:     InDom,
    pub instances: Vec<InstanceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextReq {
    pub ident:     i32,
    pub text_type: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub ident:  i32,
    pub buffer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReq {
    pub control: i32,
    pub state:   i32,
    pub delta:   i32,
    pub pmids:   Vec<PmId>,
}

/// Credential list plus the opaque bytes of a credential-exchange step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredsPdu {
    pub creds:   Vec<Credential>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmnsIds {
    pub status: i32,
    pub ids:    Vec<PmId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name:   String,
    pub status: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmnsNames {
    pub entries: Vec<NameEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmnsChild {
    pub subtype: i32,
    pub name:    String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmnsTraverse {
    pub subtype: i32,
    pub name:    String,
}

/// A decoded PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Error(ErrorPdu),
    Result(PmResult),
    Profile(Profile),
    Fetch(FetchReq),
    DescReq(PmId),
    Desc(Desc),
    InstanceReq(InstanceReq),
    Instance(InstanceResult),
    TextReq(TextReq),
    Text(Text),
    ControlReq(ControlReq),
    Creds(CredsPdu),
    PmnsIds(PmnsIds),
    PmnsNames(PmnsNames),
    PmnsChild(PmnsChild),
    PmnsTraverse(PmnsTraverse),
}

impl Pdu {
    /// Plain status report.
    pub fn error(code: i32) -> Self {
        Pdu::Error(ErrorPdu { code, datum: None })
    }

    pub fn kind(&self) -> PduType {
        match self {
            Pdu::Error(_) => PduType::Error,
            Pdu::Result(_) => PduType::Result,
            Pdu::Profile(_) => PduType::Profile,
            Pdu::Fetch(_) => PduType::Fetch,
            Pdu::DescReq(_) => PduType::DescReq,
            Pdu::Desc(_) => PduType::Desc,
            Pdu::InstanceReq(_) => PduType::InstanceReq,
            Pdu::Instance(_) => PduType::Instance,
            Pdu::TextReq(_) => PduType::TextReq,
            Pdu::Text(_) => PduType::Text,
            Pdu::ControlReq(_) => PduType::ControlReq,
            Pdu::Creds(_) => PduType::Creds,
            Pdu::PmnsIds(_) => PduType::PmnsIds,
            Pdu::PmnsNames(_) => PduType::PmnsNames,
            Pdu::PmnsChild(_) => PduType::PmnsChild,
            Pdu::PmnsTraverse(_) => PduType::PmnsTraverse,
        }
    }

    pub fn encode(&self, origin: i32) -> PduFrame {
        self.encode_with(origin, SlotWidth::WIRE)
    }

    pub fn encode_with(&self, origin: i32, width: SlotWidth) -> PduFrame {
        let mut w = PduWriter::new();
        match self {
            Pdu::Error(e) => {
                w.put_i32(e.code);
                if let Some(datum) = e.datum {
                    w.put_i32(datum);
                }
            }
            Pdu::Result(r) => encode_result(&mut w, r, width),
            Pdu::Profile(p) => {
                w.put_i32(p.ctx);
                w.put_i32(p.state);
                w.put_i32(p.profiles.len() as i32);
                for prof in &p.profiles {
                    w.put_u32(prof.indom.raw());
                    w.put_i32(prof.state);
                    w.put_i32(prof.instances.len() as i32);
                    for inst in &prof.instances {
                        w.put_i32(*inst);
                    }
                }
            }
            Pdu::Fetch(f) => {
                w.put_i32(f.ctx);
                put_timeval(&mut w, f.when);
                put_pmids(&mut w, &f.pmids);
            }
            Pdu::DescReq(pmid) => w.put_u32(pmid.raw()),
            Pdu::Desc(d) => {
                w.put_u32(d.pmid.raw());
                w.put_i32(d.vtype);
                w.put_u32(d.indom.raw());
                w.put_i32(d.sem);
                w.put_u32(d.units);
            }
            Pdu::InstanceReq(req) => {
                put_timeval(&mut w, req.when);
                w.put_u32(req.indom.raw());
                w.put_i32(req.inst);
                w.put_opt_string(req.name.as_deref());
            }
            Pdu::Instance(res) => {
                w.put_u32(res.indom.raw());
                w.put_i32(res.instances.len() as i32);
                for entry in &res.instances {
                    w.put_i32(entry.inst);
                    w.put_opt_string(entry.name.as_deref());
                }
            }
            Pdu::TextReq(req) => {
                w.put_i32(req.ident);
                w.put_i32(req.text_type);
            }
            Pdu::Text(t) => {
                w.put_i32(t.ident);
                w.put_string(&t.buffer);
            }
            Pdu::ControlReq(c) => {
                w.put_i32(c.control);
                w.put_i32(c.state);
                w.put_i32(c.delta);
                put_pmids(&mut w, &c.pmids);
            }
            Pdu::Creds(c) => {
                w.put_i32(c.creds.len() as i32);
                for cred in &c.creds {
                    w.put_u32(cred.raw());
                }
                w.put_opaque(&c.payload);
            }
            Pdu::PmnsIds(ids) => {
                w.put_i32(ids.status);
                put_pmids(&mut w, &ids.ids);
            }
            Pdu::PmnsNames(names) => {
                w.put_i32(names.entries.len() as i32);
                for entry in &names.entries {
                    w.put_i32(entry.status);
                    w.put_string(&entry.name);
                }
            }
            Pdu::PmnsChild(c) => {
                w.put_i32(c.subtype);
                w.put_string(&c.name);
            }
            Pdu::PmnsTraverse(t) => {
                w.put_i32(t.subtype);
                w.put_string(&t.name);
            }
        }
        PduFrame::new(self.kind(), origin, &w.finish())
    }

    pub fn decode(frame: &PduFrame) -> Result<Pdu, DecodeError> {
        Self::decode_with(frame, SlotWidth::WIRE)
    }

    pub fn decode_with(frame: &PduFrame, width: SlotWidth) -> Result<Pdu, DecodeError> {
        let kind = frame.pdu_type();
        let mut r = PduReader::new(kind, frame.payload());
        let pdu = match kind {
            PduType::Error => {
                let code = r.get_i32("status")?;
                let datum = if r.remaining() > 0 {
                    Some(r.get_i32("datum")?)
                } else {
                    None
                };
                Pdu::Error(ErrorPdu { code, datum })
            }
            PduType::Result => Pdu::Result(decode_result(&mut r, width)?),
            PduType::Profile => {
                let ctx = r.get_i32("ctx")?;
                let state = r.get_i32("state")?;
                let n = r.get_count("numprof", 12)?;
                let mut profiles = Vec::with_capacity(n);
                for _ in 0..n {
                    let indom = InDom::from_raw(r.get_u32("indom")?);
                    let state = r.get_i32("state")?;
                    let ninst = r.get_count("numinst", 4)?;
                    let mut instances = Vec::with_capacity(ninst);
                    for _ in 0..ninst {
                        instances.push(r.get_i32("inst")?);
                    }
                    profiles.push(InDomProfile {
                        indom,
                        state,
                        instances,
                    });
                }
                Pdu::Profile(Profile {
                    ctx,
                    state,
                    profiles,
                })
            }
            PduType::Fetch => {
                let ctx = r.get_i32("ctx")?;
                let when = get_timeval(&mut r)?;
                let pmids = get_pmids(&mut r)?;
                Pdu::Fetch(FetchReq { ctx, when, pmids })
            }
            PduType::DescReq => Pdu::DescReq(PmId::from_raw(r.get_u32("pmid")?)),
            PduType::Desc => Pdu::Desc(Desc {
                pmid:  PmId::from_raw(r.get_u32("pmid")?),
                vtype: r.get_i32("type")?,
                indom: InDom::from_raw(r.get_u32("indom")?),
                sem:   r.get_i32("sem")?,
                units: r.get_u32("units")?,
            }),
            PduType::InstanceReq => Pdu::InstanceReq(InstanceReq {
                when:  get_timeval(&mut r)?,
                indom: InDom::from_raw(r.get_u32("indom")?),
                inst:  r.get_i32("inst")?,
                name:  r.get_opt_string("name")?,
            }),
            PduType::Instance => {
                let indom = InDom::from_raw(r.get_u32("indom")?);
                let n = r.get_count("numinst", 8)?;
                let mut instances = Vec::with_capacity(n);
                for _ in 0..n {
                    let inst = r.get_i32("inst")?;
                    let name = r.get_opt_string("name")?;
                    instances.push(InstanceEntry { inst, name });
                }
                Pdu::Instance(InstanceResult { indom, instances })
            }
            PduType::TextReq => Pdu::TextReq(TextReq {
                ident:     r.get_i32("ident")?,
                text_type: r.get_i32("type")?,
            }),
            PduType::Text => Pdu::Text(Text {
                ident:  r.get_i32("ident")?,
                buffer: r.get_string("buffer")?,
            }),
            PduType::ControlReq => Pdu::ControlReq(ControlReq {
                control: r.get_i32("control")?,
                state:   r.get_i32("state")?,
                delta:   r.get_i32("delta")?,
                pmids:   get_pmids(&mut r)?,
            }),
            PduType::Creds => {
                let n = r.get_count("numcreds", 4)?;
                let mut creds = Vec::with_capacity(n);
                for _ in 0..n {
                    creds.push(Credential::from_raw(r.get_u32("credential")?));
                }
                let payload = r.get_opaque("payload")?;
                Pdu::Creds(CredsPdu { creds, payload })
            }
            PduType::PmnsIds => Pdu::PmnsIds(PmnsIds {
                status: r.get_i32("status")?,
                ids:    get_pmids(&mut r)?,
            }),
            PduType::PmnsNames => {
                let n = r.get_count("numnames", 8)?;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    let status = r.get_i32("status")?;
                    let name = r.get_string("name")?;
                    entries.push(NameEntry { name, status });
                }
                Pdu::PmnsNames(PmnsNames { entries })
            }
            PduType::PmnsChild => Pdu::PmnsChild(PmnsChild {
                subtype: r.get_i32("subtype")?,
                name:    r.get_string("name")?,
            }),
            PduType::PmnsTraverse => Pdu::PmnsTraverse(PmnsTraverse {
                subtype: r.get_i32("subtype")?,
                name:    r.get_string("name")?,
            }),
        };
        r.finish()?;
        Ok(pdu)
    }

    /// Parses a complete frame and its payload in one step.
    pub fn from_bytes(raw: Bytes, width: SlotWidth) -> Result<(PduType, Pdu), DecodeError> {
        let frame = PduFrame::parse(raw)?;
        let pdu = Self::decode_with(&frame, width)?;
        Ok((frame.pdu_type(), pdu))
    }
}

fn put_timeval(w: &mut PduWriter, tv: Timeval) {
    w.put_i32(tv.sec);
    w.put_i32(tv.usec);
}

fn get_timeval(r: &mut PduReader) -> Result<Timeval, DecodeError> {
    Ok(Timeval {
        sec:  r.get_i32("tv_sec")?,
        usec: r.get_i32("tv_usec")?,
    })
}

fn put_pmids(w: &mut PduWriter, pmids: &[PmId]) {
    w.put_i32(pmids.len() as i32);
    for pmid in pmids {
        w.put_u32(pmid.raw());
    }
}

fn get_pmids(r: &mut PduReader) -> Result<Vec<PmId>, DecodeError> {
    let n = r.get_count("numpmid", 4)?;
    let mut pmids = Vec::with_capacity(n);
    for _ in 0..n {
        pmids.push(PmId::from_raw(r.get_u32("pmid")?));
    }
    Ok(pmids)
}

// Value blocks follow the value sets. Each block starts with
// `vtype:8 | vlen:24`, vlen counting its own header, and is padded.
const BLOCK_HEADER_LEN: usize = 4;

fn put_slot(w: &mut PduWriter, width: SlotWidth, value: i64) {
    match width {
        SlotWidth::Narrow => w.put_i32(value as i32),
        SlotWidth::Wide => w.put_i64(value),
    }
}

fn encode_result(w: &mut PduWriter, result: &PmResult, width: SlotWidth) {
    put_timeval(w, result.timestamp);
    w.put_i32(result.sets.len() as i32);

    let mut blocks: Vec<&ValueBlock> = Vec::new();
    let mut block_words = 0usize;
    for set in &result.sets {
        w.put_u32(set.pmid.raw());
        if set.status < 0 {
            w.put_i32(set.status);
            w.put_i32(VALFMT_INSITU);
            continue;
        }
        w.put_i32(set.values.len() as i32);
        match &set.values {
            ValueList::Insitu(values) => {
                w.put_i32(VALFMT_INSITU);
                for v in values {
                    w.put_i32(v.inst);
                    put_slot(w, width, v.value as i64);
                }
            }
            ValueList::Blocks(values) => {
                w.put_i32(VALFMT_DPTR);
                for v in values {
                    w.put_i32(v.inst);
                    match width {
                        SlotWidth::Narrow => w.put_u32(block_words as u32),
                        SlotWidth::Wide => w.put_u64(block_words as u64),
                    }
                    block_words += padded(BLOCK_HEADER_LEN + v.block.data.len()) / 4;
                    blocks.push(&v.block);
                }
            }
        }
    }
    for block in blocks {
        let vlen = (BLOCK_HEADER_LEN + block.data.len()) as u32 & 0x00ff_ffff;
        w.put_u32(((block.vtype as u32) << 24) | vlen);
        w.put_padded(&block.data);
    }
}

enum PendingValues {
    Insitu(Vec<InsituValue>),
    Blocks(Vec<(i32, usize)>),
    Failed,
}

fn get_slot(r: &mut PduReader, width: SlotWidth) -> Result<i64, DecodeError> {
    match width {
        SlotWidth::Narrow => Ok(r.get_i32("value slot")? as i64),
        SlotWidth::Wide => r.get_i64("value slot"),
    }
}

fn get_offset(r: &mut PduReader, width: SlotWidth) -> Result<usize, DecodeError> {
    match width {
        SlotWidth::Narrow => Ok(r.get_u32("value offset")? as usize),
        SlotWidth::Wide => {
            let off = r.get_u64("value offset")?;
            usize::try_from(off).map_err(|_| r.mismatch(format!("value offset {off} out of range")))
        }
    }
}

fn decode_result(r: &mut PduReader, width: SlotWidth) -> Result<PmResult, DecodeError> {
    let timestamp = get_timeval(r)?;
    let nsets = r.get_count("numpmid", 12)?;

    let mut pending = Vec::with_capacity(nsets);
    for _ in 0..nsets {
        let pmid = PmId::from_raw(r.get_u32("pmid")?);
        let numval = r.get_i32("numval")?;
        let valfmt = r.get_i32("valfmt")?;
        if numval < 0 {
            pending.push((pmid, numval, PendingValues::Failed));
            continue;
        }
        let numval = numval as usize;
        let per_value = 4 + width.bytes();
        if numval.saturating_mul(per_value) > r.remaining() {
            return Err(r.mismatch(format!("numval {numval} exceeds payload")));
        }
        let values = match valfmt {
            VALFMT_INSITU => {
                let mut values = Vec::with_capacity(numval);
                for _ in 0..numval {
                    let inst = r.get_i32("inst")?;
                    let raw = get_slot(r, width)?;
                    let value = i32::try_from(raw)
                        .map_err(|_| r.mismatch(format!("in-situ value {raw} exceeds 32 bits")))?;
                    values.push(InsituValue { inst, value });
                }
                PendingValues::Insitu(values)
            }
            VALFMT_DPTR | VALFMT_SPTR => {
                let mut refs = Vec::with_capacity(numval);
                for _ in 0..numval {
                    let inst = r.get_i32("inst")?;
                    refs.push((inst, get_offset(r, width)?));
                }
                PendingValues::Blocks(refs)
            }
            other => return Err(r.mismatch(format!("unknown valfmt {other}"))),
        };
        pending.push((pmid, 0, values));
    }

    let area = r.rest();
    let mut sets = Vec::with_capacity(pending.len());
    for (pmid, status, values) in pending {
        let values = match values {
            PendingValues::Failed => ValueList::Insitu(Vec::new()),
            PendingValues::Insitu(v) => ValueList::Insitu(v),
            PendingValues::Blocks(refs) => {
                let mut values = Vec::with_capacity(refs.len());
                for (inst, words) in refs {
                    values.push(BlockValue {
                        inst,
                        block: read_block(r, &area, words)?,
                    });
                }
                ValueList::Blocks(values)
            }
        };
        sets.push(ValueSet {
            pmid,
            status,
            values,
        });
    }
    Ok(PmResult { timestamp, sets })
}

fn read_block(r: &PduReader, area: &Bytes, words: usize) -> Result<ValueBlock, DecodeError> {
    let start = words.saturating_mul(4);
    if start.saturating_add(BLOCK_HEADER_LEN) > area.len() {
        return Err(r.mismatch(format!("value block offset {words} outside payload")));
    }
    let header = u32::from_be_bytes([area[start], area[start + 1], area[start + 2], area[start + 3]]);
    let vlen = (header & 0x00ff_ffff) as usize;
    if vlen < BLOCK_HEADER_LEN || start + vlen > area.len() {
        return Err(r.mismatch(format!("value block length {vlen} invalid")));
    }
    Ok(ValueBlock {
        vtype: (header >> 24) as u8,
        data:  area.slice(start + BLOCK_HEADER_LEN..start + vlen),
    })
}
