//! Destructors handed to [`Reclaimer::retire`](super::Reclaimer::retire).

/// Free an object leaked with `Box::into_raw`.
///
/// # Safety
///
/// - `ptr` must come from `Box::<T>::into_raw`.
/// - Must only be called after the epoch manager determines no guard can
///   still observe it.
pub(crate) unsafe fn reclaim_boxed<T>(ptr: *mut u8) {
    // SAFETY: caller guarantees `ptr` is a leaked `Box<T>` with no readers.
    unsafe { drop(Box::from_raw(ptr.cast::<T>())) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reclaim_boxed_runs_destructor() {
        let shared: Arc<()> = Arc::new(());
        let ptr: *mut Arc<()> = Box::into_raw(Box::new(Arc::clone(&shared)));
        assert_eq!(Arc::strong_count(&shared), 2);

        // SAFETY: `ptr` was just leaked from a Box and has no other users.
        unsafe { reclaim_boxed::<Arc<()>>(ptr.cast::<u8>()) };

        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
