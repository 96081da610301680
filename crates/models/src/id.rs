/// Id is an opaque, globally-unique identifier assigned to a `MigrationRequest`,
/// `Migration`, or other durable record. It's encoded as lower-case hex over the
/// wire and in the database, and internally is a big-endian i64 so that ids
/// sort consistently with their allocation order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 8]);

impl Id {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
    pub fn new(b: [u8; 8]) -> Self {
        Self(b)
    }
    pub fn zero() -> Self {
        Self([0u8; 8])
    }
    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
        let vec_bytes = hex::decode(hex)?;
        let exact: [u8; 8] = vec_bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;

        Ok(Id(exact))
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let no_colons = s.replace(':', "");
        Id::from_hex(&no_colons)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", i64::from_be_bytes(self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::from_hex(str_val.as_ref()).map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Type<sqlx::Postgres> for Id {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Encode<'_, sqlx::Postgres> for Id {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        sqlx::Encode::<sqlx::Postgres>::encode(i64::from_be_bytes(self.0), buf)
    }
}

#[cfg(feature = "sqlx-support")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Id {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let v = <i64 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(Id(v.to_be_bytes()))
    }
}

/// IdGenerator assigns process-unique, time-ordered [`Id`]s.
///
/// Ids are structured as a 42-bit millisecond timestamp, a 10-bit shard
/// number (to avoid collisions between concurrently-running coordinators),
/// and a 12-bit per-millisecond sequence counter -- the same layout class
/// as a Twitter Snowflake id, sized to fit the 8-byte [`Id`].
#[derive(Clone)]
pub struct IdGenerator {
    shard: u16,
    last_millis: u64,
    sequence: u16,
}

const SEQUENCE_BITS: u32 = 12;
const SHARD_BITS: u32 = 10;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;
const SHARD_MASK: u16 = (1 << SHARD_BITS) - 1;

impl IdGenerator {
    pub fn new(shard: u16) -> Self {
        Self {
            shard: shard & SHARD_MASK,
            last_millis: 0,
            sequence: 0,
        }
    }

    /// Generate the next Id, blocking (in terms of logical sequence, not
    /// wall time) through a millisecond boundary if this shard has produced
    /// more than 4096 ids within the current millisecond.
    pub fn next(&mut self) -> Id {
        let mut millis = now_millis();

        if millis == self.last_millis {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                // Exhausted this millisecond's sequence space; spin to the next one.
                while millis <= self.last_millis {
                    millis = now_millis();
                }
            }
        } else {
            self.sequence = 0;
        }
        self.last_millis = millis;

        let value = (millis << (SHARD_BITS + SEQUENCE_BITS))
            | ((self.shard as u64) << SEQUENCE_BITS)
            | (self.sequence as u64);

        Id((value as i64).to_be_bytes())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_monotonic_within_a_shard() {
        let mut gen = IdGenerator::new(7);
        let mut prior = gen.next();
        for _ in 0..10_000 {
            let next = gen.next();
            assert!(next > prior, "{next:?} should exceed {prior:?}");
            prior = next;
        }
    }

    #[test]
    fn hex_round_trips() {
        let id = IdGenerator::new(1).next();
        let hex = format!("{id}");
        assert_eq!(id, hex.parse().unwrap());
    }

    #[test]
    fn zero_is_recognized() {
        assert!(Id::zero().is_zero());
        assert!(!IdGenerator::new(1).next().is_zero());
    }
}
