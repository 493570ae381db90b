/// Integer division, rounding up.
#[macro_export]
macro_rules! ceil_div {
    ($a:expr, $b:expr) => {
        (($a) + ($b) - 1) / ($b)
    };
}

/// Checks whether a value is a power of two.
pub fn is_pow2(val: u32) -> bool
{
    val != 0 && val & (val - 1) == 0
}

/// Base-2 logarithm of a power of two.
pub fn log2(val: u32) -> u32
{
    debug_assert!(is_pow2(val));

    31 - val.leading_zeros()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2()
    {
        assert!(is_pow2(1));
        assert!(is_pow2(64));
        assert!(!is_pow2(0));
        assert!(!is_pow2(96));

        assert_eq!(log2(1), 0);
        assert_eq!(log2(128), 7);
    }

    #[test]
    fn ceil()
    {
        assert_eq!(ceil_div!(9, 8), 2);
        assert_eq!(ceil_div!(16, 8), 2);
        assert_eq!(ceil_div!(1, 8), 1);
    }
}
