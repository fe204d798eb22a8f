/// Trait for casting to [usize] that allows you to say that you expect the
/// platform's pointer size to fit the value. The methods are non-panicking
/// on the targets the JIT builds for.
pub(crate) trait IntoUsize {
    /// Convert to usize. Implementation conditional on the pointer size of
    /// the platform.
    fn as_usize(self) -> usize;
}

#[cfg(target_pointer_width = "64")]
impl IntoUsize for u64 {
    fn as_usize(self) -> usize {
        self as usize
    }
}

impl IntoUsize for u32 {
    fn as_usize(self) -> usize {
        self.try_into().unwrap()
    }
}

impl IntoUsize for u16 {
    /// Alias for `.into()`. For convenience so you could use the trait for
    /// all unsigned types.
    fn as_usize(self) -> usize {
        self.into()
    }
}

impl IntoUsize for u8 {
    /// Alias for `.into()`. For convenience so you could use the trait for
    /// all unsigned types.
    fn as_usize(self) -> usize {
        self.into()
    }
}
