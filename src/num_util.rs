/// `x++` for id counters: returns the current value, then advances it.
pub trait Postincrement {
    fn postincrement(&mut self) -> Self;
}

macro_rules! impl_postincrement {
    ($($t:ty),*) => {
        $(
            impl Postincrement for $t {
                fn postincrement(&mut self) -> Self {
                    let value = *self;
                    *self += 1;
                    value
                }
            }
        )*
    };
}

impl_postincrement!(u32, u64, usize);
