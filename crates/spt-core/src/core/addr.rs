use super::macros::impl_addr;

impl_addr!(Gfn, u64, "Guest Frame Number");
impl_addr!(Hfn, u64, "Host Frame Number");
impl_addr!(Pa, u64, "Guest Physical Address");
impl_addr!(Va, u64, "Guest Virtual Address");
