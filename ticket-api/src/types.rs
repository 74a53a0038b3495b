use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

pub type EventId = u64;
pub type TicketId = u64;

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("address pattern compiles"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid address '{0}'")]
    Address(String),
    #[error("invalid amount '{0}'")]
    Amount(String),
    #[error("invalid network id '{0}'")]
    Network(String),
    #[error("unknown role '{0}'")]
    Role(String),
}

/// Account or contract identity: `0x` followed by 40 hex digits, kept lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let trimmed = s.trim();
        if ADDRESS_RE.is_match(trimmed) {
            Ok(Address(trimmed.to_ascii_lowercase()))
        } else {
            Err(ParseError::Address(s.to_string()))
        }
    }

    pub fn zero() -> Self {
        Address(format!("0x{}", "0".repeat(40)))
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in headers, e.g. `0x1234...abcd`.
    pub fn short(&self) -> String {
        format!("{}...{}", &self.0[..6], &self.0[38..])
    }
}

impl FromStr for Address {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.0
    }
}

impl From<Address> for Value {
    fn from(a: Address) -> Value {
        Value::String(a.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Amount in the ledger's smallest unit. Travels as a decimal string so no
/// JSON number ever rounds it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Wei(u128);

impl Wei {
    pub const ZERO: Wei = Wei(0);

    pub const fn new(value: u128) -> Self {
        Wei(value)
    }

    pub const fn value(self) -> u128 {
        self.0
    }

    pub fn checked_mul(self, quantity: u64) -> Option<Wei> {
        self.0.checked_mul(u128::from(quantity)).map(Wei)
    }

    pub fn checked_add(self, other: Wei) -> Option<Wei> {
        self.0.checked_add(other.0).map(Wei)
    }
}

impl FromStr for Wei {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.strip_prefix("0x") {
            Some(hex) => u128::from_str_radix(hex, 16),
            None => trimmed.parse::<u128>(),
        };
        parsed.map(Wei).map_err(|_| ParseError::Amount(s.to_string()))
    }
}

impl TryFrom<String> for Wei {
    type Error = ParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Wei> for String {
    fn from(w: Wei) -> String {
        w.0.to_string()
    }
}

impl From<Wei> for Value {
    fn from(w: Wei) -> Value {
        Value::String(w.0.to_string())
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chain identifier, exchanged as a `0x`-prefixed hex quantity like `eth_chainId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkId(pub u64);

impl FromStr for NetworkId {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed.map(NetworkId).map_err(|_| ParseError::Network(s.to_string()))
    }
}

impl TryFrom<String> for NetworkId {
    type Error = ParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NetworkId> for String {
    fn from(n: NetworkId) -> String {
        format!("0x{:x}", n.0)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger-defined role identifier (a bytes32 hash rendered as hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub String);

impl From<RoleId> for Value {
    fn from(r: RoleId) -> Value {
        Value::String(r.0)
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Organizer,
    Validator,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Organizer, Role::Validator];

    /// Name of the contract's constant getter for this role's identifier.
    pub fn getter(self) -> &'static str {
        match self {
            Role::Organizer => "ORGANIZER_ROLE",
            Role::Validator => "VALIDATOR_ROLE",
        }
    }
}

impl FromStr for Role {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "organizer" | "organizer_role" => Ok(Role::Organizer),
            "validator" | "validator_role" => Ok(Role::Validator),
            _ => Err(ParseError::Role(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Organizer => f.write_str("organizer"),
            Role::Validator => f.write_str("validator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum TicketState {
    Valid,
    Used,
    Refunded,
    Cancelled,
}

impl TicketState {
    pub fn is_valid(self) -> bool {
        self == TicketState::Valid
    }

    pub fn label(self) -> &'static str {
        match self {
            TicketState::Valid => "VALID",
            TicketState::Used => "USED",
            TicketState::Refunded => "REFUNDED",
            TicketState::Cancelled => "CANCELLED",
        }
    }
}

impl From<u8> for TicketState {
    fn from(code: u8) -> Self {
        match code {
            0 => TicketState::Valid,
            1 => TicketState::Used,
            2 => TicketState::Refunded,
            _ => TicketState::Cancelled,
        }
    }
}

impl From<TicketState> for u8 {
    fn from(state: TicketState) -> u8 {
        match state {
            TicketState::Valid => 0,
            TicketState::Used => 1,
            TicketState::Refunded => 2,
            TicketState::Cancelled => 3,
        }
    }
}

/// Result of `events(id)`. Unknown ids come back zeroed, with `id == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: EventId,
    pub name: String,
    pub ticket_price: Wei,
    pub is_active: bool,
}

impl EventRecord {
    pub fn exists(&self) -> bool {
        self.id != 0
    }
}

/// One slot of `getTicketsByUserPaginated`. Unused slots are zeroed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRecord {
    pub id: TicketId,
    pub event_id: EventId,
    pub state: TicketState,
    pub purchase_price: Wei,
}

impl TicketRecord {
    pub fn is_placeholder(&self) -> bool {
        self.id == 0
    }

    pub fn placeholder() -> Self {
        TicketRecord {
            id: 0,
            event_id: 0,
            state: TicketState::Valid,
            purchase_price: Wei::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: TxHash,
    #[serde(with = "quantity")]
    pub block_number: u64,
    /// `0x1` on the wire for success, `0x0` for a revert.
    #[serde(with = "receipt_status")]
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Flag(bool),
    Number(u64),
    Text(String),
}

fn parse_quantity(s: &str) -> Option<u64> {
    let trimmed = s.trim();
    match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => trimmed.parse().ok(),
    }
}

/// Node quantities are `0x`-prefixed hex strings; plain numbers are accepted too.
mod quantity {
    use super::{RawQuantity, parse_quantity};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match RawQuantity::deserialize(deserializer)? {
            RawQuantity::Number(n) => Ok(n),
            RawQuantity::Text(s) => {
                parse_quantity(&s).ok_or_else(|| D::Error::custom(format!("invalid quantity '{}'", s)))
            }
            RawQuantity::Flag(b) => Err(D::Error::custom(format!("expected a quantity, got {}", b))),
        }
    }
}

mod receipt_status {
    use super::{RawQuantity, parse_quantity};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ok: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *ok { "0x1" } else { "0x0" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let code = match RawQuantity::deserialize(deserializer)? {
            RawQuantity::Flag(b) => return Ok(b),
            RawQuantity::Number(n) => Some(n),
            RawQuantity::Text(s) => parse_quantity(&s),
        };
        match code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(D::Error::custom("receipt status must be 0x0 or 0x1")),
        }
    }
}

/// A contract function invocation: function name plus positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ContractCall {
    pub fn new(function: &str) -> Self {
        ContractCall {
            function: function.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub call: ContractCall,
    pub value: Wei,
}
