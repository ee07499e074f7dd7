mod addr;
pub(crate) mod macros;

pub use self::addr::{Gfn, Hfn, Pa, Va};
