/// Largest number of tags the controller accepts in one request.
pub const MAX_BATCH_SIZE: usize = 20;

/// Splits `items` into consecutive chunks of at most `size` elements,
/// preserving order. An empty input yields no chunks. The returned iterator
/// is lazy and can be cloned to walk the batches again.
pub fn batches<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}
