//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two `Money`
/// values with the same amount and currency are the same money. To "modify"
/// one, build a new one.
///
/// ```ignore
/// let a = Money::from_minor(10_000, Currency::Cad)?;
/// let b = Money::from_minor(10_000, Currency::Cad)?;
/// assert_eq!(a, b);
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
