use super::NegentropyError;

pub const PROTOCOL_VERSION: u8 = 0x61;

pub(crate) const ID_SIZE: usize = 32;
pub(crate) const FINGERPRINT_SIZE: usize = 16;

const MAX_RANGES: usize = 8192;
const MAX_IDS_PER_RANGE: u64 = 100_000;
const MAX_BITFIELD_LEN: u64 = 1024 * 1024;

/// Upper bound of a range. Items sort by timestamp, then by id bytes, and
/// the prefix only needs to be long enough to separate neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub timestamp: u64,
    prefix: [u8; ID_SIZE],
    prefix_len: usize,
}

impl Bound {
    pub fn new(timestamp: u64, prefix: &[u8]) -> Result<Self, NegentropyError> {
        if prefix.len() > ID_SIZE {
            return Err(NegentropyError::PrefixTooLong(prefix.len() as u64));
        }
        let mut buf = [0u8; ID_SIZE];
        buf[..prefix.len()].copy_from_slice(prefix);
        Ok(Self {
            timestamp,
            prefix: buf,
            prefix_len: prefix.len(),
        })
    }

    pub fn from_id(timestamp: u64, id: &[u8; ID_SIZE]) -> Self {
        Self {
            timestamp,
            prefix: *id,
            prefix_len: ID_SIZE,
        }
    }

    /// Sorts after every item
    pub fn infinity() -> Self {
        Self {
            timestamp: u64::MAX,
            prefix: [0; ID_SIZE],
            prefix_len: 0,
        }
    }

    pub fn is_infinity(&self) -> bool {
        self.timestamp == u64::MAX
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix[..self.prefix_len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Skip = 0,
    Fingerprint = 1,
    IdList = 2,
    /// Only produced by older negentropy peers. We read it but never send it.
    IdListResponse = 3,
}

impl Mode {
    fn from_u64(v: u64) -> Result<Self, NegentropyError> {
        match v {
            0 => Ok(Mode::Skip),
            1 => Ok(Mode::Fingerprint),
            2 => Ok(Mode::IdList),
            3 => Ok(Mode::IdListResponse),
            other => Err(NegentropyError::UnknownMode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    Skip,
    Fingerprint([u8; FINGERPRINT_SIZE]),
    IdList(Vec<[u8; ID_SIZE]>),
    IdListResponse {
        have_ids: Vec<[u8; ID_SIZE]>,
        bitfield: Vec<u8>,
    },
}

impl RangePayload {
    pub fn mode(&self) -> Mode {
        match self {
            RangePayload::Skip => Mode::Skip,
            RangePayload::Fingerprint(_) => Mode::Fingerprint,
            RangePayload::IdList(_) => Mode::IdList,
            RangePayload::IdListResponse { .. } => Mode::IdListResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub upper: Bound,
    pub payload: RangePayload,
}

pub(crate) fn encode_varint(out: &mut Vec<u8>, mut n: u64) {
    let mut groups = [0u8; 10];
    let mut len = 0;
    loop {
        groups[len] = (n & 0x7f) as u8;
        len += 1;
        n >>= 7;
        if n == 0 {
            break;
        }
    }
    for i in (0..len).rev() {
        let cont = if i == 0 { 0 } else { 0x80 };
        out.push(groups[i] | cont);
    }
}

/// Running 256-bit sum of ids, little endian, wrapping
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Accumulator {
    sum: [u8; ID_SIZE],
}

impl Accumulator {
    pub fn add(&mut self, id: &[u8; ID_SIZE]) {
        let mut carry = 0u16;
        for (acc, b) in self.sum.iter_mut().zip(id.iter()) {
            let v = *acc as u16 + *b as u16 + carry;
            *acc = v as u8;
            carry = v >> 8;
        }
    }

    pub fn fingerprint(&self, count: usize) -> [u8; FINGERPRINT_SIZE] {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.sum);
        let mut len = Vec::with_capacity(10);
        encode_varint(&mut len, count as u64);
        hasher.update(&len);
        let digest = hasher.finalize();

        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        out
    }
}

/// Message writer. Timestamps are delta encoded against the previous
/// bound, so a clone carries that state along with the bytes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
    prev_ts: u64,
}

impl Encoder {
    pub fn with_version() -> Self {
        Self {
            buf: vec![PROTOCOL_VERSION],
            prev_ts: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_varint(&mut self, n: u64) {
        encode_varint(&mut self.buf, n);
    }

    fn write_bound(&mut self, bound: &Bound) {
        if bound.is_infinity() {
            self.write_varint(0);
        } else {
            let delta = bound.timestamp.saturating_sub(self.prev_ts);
            self.write_varint(delta.saturating_add(1));
            self.prev_ts = bound.timestamp;
        }
        self.write_varint(bound.prefix_len as u64);
        self.buf.extend_from_slice(bound.prefix());
    }

    pub fn write_range(&mut self, range: &Range) {
        self.write_bound(&range.upper);
        self.write_varint(range.payload.mode() as u64);
        match &range.payload {
            RangePayload::Skip => {}
            RangePayload::Fingerprint(fp) => self.buf.extend_from_slice(fp),
            RangePayload::IdList(ids) => {
                self.write_varint(ids.len() as u64);
                for id in ids {
                    self.buf.extend_from_slice(id);
                }
            }
            RangePayload::IdListResponse { have_ids, bitfield } => {
                self.write_varint(have_ids.len() as u64);
                for id in have_ids {
                    self.buf.extend_from_slice(id);
                }
                self.write_varint(bitfield.len() as u64);
                self.buf.extend_from_slice(bitfield);
            }
        }
    }
}

pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    prev_ts: u64,
    ranges: usize,
}

impl<'a> Decoder<'a> {
    /// Checks the version byte and positions the decoder on the first range
    pub fn new(buf: &'a [u8]) -> Result<Self, NegentropyError> {
        let Some(&version) = buf.first() else {
            return Err(NegentropyError::EmptyMessage);
        };
        if version != PROTOCOL_VERSION {
            return Err(NegentropyError::UnsupportedVersion(version));
        }
        Ok(Self {
            buf,
            pos: 1,
            prev_ts: 0,
            ranges: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], NegentropyError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(NegentropyError::Truncated)?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_varint(&mut self) -> Result<u64, NegentropyError> {
        let mut n: u64 = 0;
        loop {
            let b = *self.buf.get(self.pos).ok_or(NegentropyError::Truncated)?;
            self.pos += 1;
            if n > (u64::MAX >> 7) {
                return Err(NegentropyError::VarintOverflow);
            }
            n = (n << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(n);
            }
        }
    }

    fn read_id(&mut self) -> Result<[u8; ID_SIZE], NegentropyError> {
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(self.read_bytes(ID_SIZE)?);
        Ok(id)
    }

    fn read_ids(&mut self) -> Result<Vec<[u8; ID_SIZE]>, NegentropyError> {
        let count = self.read_varint()?;
        if count > MAX_IDS_PER_RANGE {
            return Err(NegentropyError::TooManyIds(count));
        }
        // all ids must be present before we allocate for them
        let needed = (count as usize) * ID_SIZE;
        if self.buf.len() - self.pos < needed {
            return Err(NegentropyError::Truncated);
        }
        (0..count).map(|_| self.read_id()).collect()
    }

    fn read_bound(&mut self) -> Result<Bound, NegentropyError> {
        let encoded = self.read_varint()?;
        let timestamp = if encoded == 0 {
            u64::MAX
        } else {
            let ts = self
                .prev_ts
                .checked_add(encoded - 1)
                .ok_or(NegentropyError::TimestampOverflow)?;
            self.prev_ts = ts;
            ts
        };

        let prefix_len = self.read_varint()?;
        if prefix_len > ID_SIZE as u64 {
            return Err(NegentropyError::PrefixTooLong(prefix_len));
        }
        let prefix = self.read_bytes(prefix_len as usize)?;
        Bound::new(timestamp, prefix)
    }

    pub fn read_range(&mut self) -> Result<Range, NegentropyError> {
        self.ranges += 1;
        if self.ranges > MAX_RANGES {
            return Err(NegentropyError::TooManyRanges);
        }

        let upper = self.read_bound()?;
        let payload = match Mode::from_u64(self.read_varint()?)? {
            Mode::Skip => RangePayload::Skip,
            Mode::Fingerprint => {
                let mut fp = [0u8; FINGERPRINT_SIZE];
                fp.copy_from_slice(self.read_bytes(FINGERPRINT_SIZE)?);
                RangePayload::Fingerprint(fp)
            }
            Mode::IdList => RangePayload::IdList(self.read_ids()?),
            Mode::IdListResponse => {
                let have_ids = self.read_ids()?;
                let bf_len = self.read_varint()?;
                if bf_len > MAX_BITFIELD_LEN {
                    return Err(NegentropyError::Truncated);
                }
                let bitfield = self.read_bytes(bf_len as usize)?.to_vec();
                RangePayload::IdListResponse { have_ids, bitfield }
            }
        };

        Ok(Range { upper, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(n: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint(&mut out, n);
        out
    }

    #[test]
    fn varint_is_msb_first() {
        assert_eq!(varint(0), vec![0x00]);
        assert_eq!(varint(127), vec![0x7f]);
        assert_eq!(varint(128), vec![0x81, 0x00]);
        assert_eq!(varint(300), vec![0x82, 0x2c]);
        assert_eq!(varint(u64::MAX).len(), 10);
    }

    #[test]
    fn varint_overflow_is_rejected() {
        let mut msg = vec![PROTOCOL_VERSION];
        msg.extend(std::iter::repeat(0xff).take(11));
        msg.push(0x01);
        let mut dec = Decoder::new(&msg).unwrap();
        assert_eq!(dec.read_range(), Err(NegentropyError::VarintOverflow));
    }

    #[test]
    fn bad_version_and_empty() {
        assert!(matches!(Decoder::new(&[]), Err(NegentropyError::EmptyMessage)));
        assert!(matches!(
            Decoder::new(&[0x62]),
            Err(NegentropyError::UnsupportedVersion(0x62))
        ));
    }

    #[test]
    fn bounds_are_delta_encoded() {
        let mut enc = Encoder::with_version();
        let ranges = [
            Range {
                upper: Bound::new(1000, &[0xaa]).unwrap(),
                payload: RangePayload::Skip,
            },
            Range {
                upper: Bound::new(1005, &[]).unwrap(),
                payload: RangePayload::Fingerprint([7; FINGERPRINT_SIZE]),
            },
            Range {
                upper: Bound::infinity(),
                payload: RangePayload::IdList(vec![[1; 32], [2; 32]]),
            },
        ];
        for r in &ranges {
            enc.write_range(r);
        }
        let bytes = enc.into_bytes();

        // second bound only carries the 5 second delta (+1)
        let first = 1 + varint(1001).len() + 1 + 1 + 1;
        assert_eq!(bytes[first], 6);

        let mut dec = Decoder::new(&bytes).unwrap();
        for r in &ranges {
            assert_eq!(&dec.read_range().unwrap(), r);
        }
        assert!(dec.is_empty());
    }

    #[test]
    fn truncated_id_list() {
        let mut enc = Encoder::with_version();
        enc.write_range(&Range {
            upper: Bound::infinity(),
            payload: RangePayload::IdList(vec![[1; 32]]),
        });
        let mut bytes = enc.into_bytes();
        bytes.truncate(bytes.len() - 1);

        let mut dec = Decoder::new(&bytes).unwrap();
        assert_eq!(dec.read_range(), Err(NegentropyError::Truncated));
    }

    #[test]
    fn oversized_prefix() {
        // ts=inf, prefix_len=33
        let bytes = [PROTOCOL_VERSION, 0x00, 0x21];
        let mut dec = Decoder::new(&bytes).unwrap();
        assert_eq!(dec.read_range(), Err(NegentropyError::PrefixTooLong(33)));
    }

    #[test]
    fn accumulator_wraps() {
        let mut acc = Accumulator::default();
        acc.add(&[0xff; 32]);
        acc.add(&{
            let mut one = [0u8; 32];
            one[0] = 1;
            one
        });
        assert_eq!(acc.sum, [0u8; 32]);
    }

    #[test]
    fn fingerprint_depends_on_count() {
        let acc = Accumulator::default();
        assert_ne!(acc.fingerprint(0), acc.fingerprint(1));
    }
}
