//! Method references used as call operands.

use std::{fmt, sync::Arc};

use crate::metadata::token::Token;

/// A resolved reference to a method, as carried by `call`, `callvirt` and `newobj`.
///
/// Besides the metadata token the reference carries the bits of the signature the engine
/// needs for stack analysis: the number of declared parameters, whether an implicit `this`
/// is passed and whether a value is returned. Names are kept for listings and anchor
/// matching only.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::MethodRef;
/// use dotpatch::metadata::token::Token;
///
/// let check = MethodRef::new(Token::method_def(12), "ReservedSlot", "HasReservedSlot")
///     .with_params(2)
///     .returning();
/// assert_eq!(check.pops(), 2);
/// assert_eq!(check.pushes(), 1);
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    /// Metadata token of the method
    pub token: Token,
    /// Name of the declaring type
    pub declaring_type: Arc<str>,
    /// Method name
    pub name: Arc<str>,
    /// Number of declared parameters (excluding `this`)
    pub param_count: u8,
    /// `true` for instance methods, which take `this` as an extra argument
    pub has_this: bool,
    /// `true` if the method returns a value
    pub returns_value: bool,
}

impl MethodRef {
    /// Creates a static, parameterless, void method reference.
    pub fn new(token: Token, declaring_type: &str, name: &str) -> Self {
        MethodRef {
            token,
            declaring_type: Arc::from(declaring_type),
            name: Arc::from(name),
            param_count: 0,
            has_this: false,
            returns_value: false,
        }
    }

    /// Sets the number of declared parameters.
    #[must_use]
    pub fn with_params(mut self, count: u8) -> Self {
        self.param_count = count;
        self
    }

    /// Marks the method as an instance method.
    #[must_use]
    pub fn instance(mut self) -> Self {
        self.has_this = true;
        self
    }

    /// Marks the method as returning a value.
    #[must_use]
    pub fn returning(mut self) -> Self {
        self.returns_value = true;
        self
    }

    /// Values consumed by a `call`/`callvirt` of this method.
    #[must_use]
    pub fn pops(&self) -> u8 {
        self.param_count + u8::from(self.has_this)
    }

    /// Values produced by a `call`/`callvirt` of this method.
    #[must_use]
    pub fn pushes(&self) -> u8 {
        u8::from(self.returns_value)
    }

    /// `Type::Name` form used in listings.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}::{}/{}{} [{}]",
            if self.has_this { "instance " } else { "" },
            self.declaring_type,
            self.name,
            self.param_count,
            if self.returns_value { " -> value" } else { "" },
            self.token
        )
    }
}
