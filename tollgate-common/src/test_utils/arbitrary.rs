//! Common proptest strategies.

use proptest::{collection, sample, strategy::Strategy};

/// The characters allowed in id strings.
const ID_CHARS: &[char] = &[
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'x', 'y', 'z', 'A', 'B', 'Z',
    '0', '1', '2', '5', '9', '_', '-', '.',
];

/// A strategy for valid id strings (non-empty, bounded, ASCII graphic,
/// no ':').
pub fn any_id_string() -> impl Strategy<Value = String> {
    collection::vec(sample::select(ID_CHARS), 1..=24)
        .prop_map(|chars| chars.into_iter().collect())
}

/// A strategy for arbitrary (printable ASCII) strings, e.g. error messages
/// or reasons.
pub fn any_string() -> impl Strategy<Value = String> {
    collection::vec(32u8..=126, 0..=64).prop_map(|bytes| {
        bytes.into_iter().map(char::from).collect()
    })
}

/// A strategy for non-empty printable ASCII strings.
pub fn any_nonempty_string() -> impl Strategy<Value = String> {
    collection::vec(32u8..=126, 1..=64).prop_map(|bytes| {
        bytes.into_iter().map(char::from).collect()
    })
}
