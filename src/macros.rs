//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields stored as
//! little-endian wrapper types (U16, U32, U64). The on-disk structs
//! ([`crate::storage::SuperBlock`], [`crate::btree::NodeHeader`]) keep their
//! fields private and expose native integers through these accessors.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     num_entries: U16,
//!     parent: U64,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         num_entries: u16,
//!         parent: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn num_entries(&self) -> u16 { self.num_entries.get() }
//! // pub fn set_num_entries(&mut self, val: u16) { ... }
//! // pub fn parent(&self) -> u64 { self.parent.get() }
//! // pub fn set_parent(&mut self, val: u64) { ... }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
