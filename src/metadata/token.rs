use std::fmt;
use std::hash::{Hash, Hasher};

/// A metadata token identifying a method, type or string inside the host.
///
/// Tokens consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
///
/// Patch targets, call operands and event constructors are all addressed by token, which
/// keeps the identity stable across host recompilation as long as the metadata row is.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Table id of `TypeDef` rows
    pub const TYPE_DEF: u8 = 0x02;
    /// Table id of `MethodDef` rows
    pub const METHOD_DEF: u8 = 0x06;
    /// Table id of `MemberRef` rows
    pub const MEMBER_REF: u8 = 0x0A;
    /// Table id of the user string heap
    pub const USER_STRING: u8 = 0x70;

    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table id and a row index
    #[must_use]
    pub const fn from_parts(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// Creates a `MethodDef` token for the given row
    #[must_use]
    pub const fn method_def(row: u32) -> Self {
        Self::from_parts(Self::METHOD_DEF, row)
    }

    /// Creates a `MemberRef` token for the given row
    #[must_use]
    pub const fn member_ref(row: u32) -> Self {
        Self::from_parts(Self::MEMBER_REF, row)
    }

    /// Creates a `TypeDef` token for the given row
    #[must_use]
    pub const fn type_def(row: u32) -> Self {
        Self::from_parts(Self::TYPE_DEF, row)
    }

    /// Returns the raw token value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub const fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub const fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}
