//! Encapsulates a list of "soft error"s
//!
//! A "soft error" is an error that is encountered while producing a crash
//! report that doesn't totally prevent the report from being useful, but
//! means it may have missing or invalid information in one of its parts.
//!
//! It should be returned by a function when the function was able to
//! at-least partially achieve its goal, and when further use of functions in
//! the same subsystem is still permissible.
//!
//! An example: the symbolicator failing to find a method covering some IP is
//! a soft error from the cursor's point of view (the frame is still worth
//! reporting, just without a symbol), but the unwinder hitting a corrupt
//! frame pointer is not soft from the cursor's point of view -- it has to
//! stop unwinding.

use serde::Serialize;

/// Holds a list of soft errors. See module-level docs.
#[derive(Debug)]
pub struct SoftErrorList<E> {
    errors: Vec<E>,
}

impl SoftErrorList<()> {
    /// Create a sublist that will never be used.
    ///
    /// Useful when calling a function that returns soft errors, but the
    /// caller doesn't care.
    pub fn null_sublist<T>() -> SoftErrorSublist<'static, T> {
        SoftErrorSublist {
            list: SoftErrorList::default(),
            sink: None,
        }
    }
}

impl<E> SoftErrorList<E> {
    /// Returns true if there are no errors in the list.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors in the list.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Add a new error to the end of the list.
    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    /// Immutable iteration of the list items.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.errors.iter()
    }

    /// Create a sublist that will be inserted directly into the caller's
    /// error list.
    pub fn inserted_sublist(&mut self) -> SoftErrorSublist<'_, E> {
        SoftErrorSublist {
            list: SoftErrorList::default(),
            sink: Some(Box::new(SimplePush { target: self })),
        }
    }

    /// Create a sublist that will be mapped into a single error in the
    /// caller's error list.
    ///
    /// Useful to bridge abstraction boundaries, where an entire list of soft
    /// errors from a subfunction is wrapped up in a single error item on the
    /// caller's side.
    pub fn map_sublist<'a, T, F>(&'a mut self, map_fn: F) -> SoftErrorSublist<'a, T>
    where
        F: FnOnce(SoftErrorList<T>) -> E + 'a,
    {
        SoftErrorSublist {
            list: SoftErrorList::default(),
            sink: Some(Box::new(MapPush {
                map_fn,
                target: self,
            })),
        }
    }
}

impl<E: Serialize> SoftErrorList<E> {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.errors)
    }
}

impl<E> Default for SoftErrorList<E> {
    fn default() -> Self {
        Self { errors: Vec::new() }
    }
}

impl<E: std::error::Error> std::fmt::Display for SoftErrorList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "one or more soft errors occurred:")?;
        for (i, e) in self.errors.iter().enumerate() {
            writeln!(f, "  {i}: {e}")?;
        }
        Ok(())
    }
}

impl<E: std::error::Error> std::error::Error for SoftErrorList<E> {}

impl<E> IntoIterator for SoftErrorList<E> {
    type Item = E;
    type IntoIter = <Vec<E> as IntoIterator>::IntoIter;
    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

/// A sublist that will be merged into the caller's error list on [`Drop`].
///
/// Every sublist holds a reference to the caller's error list for its
/// lifetime. When it goes out of scope, it merges into the caller's list
/// using whatever strategy the caller asked for at construction time.
pub struct SoftErrorSublist<'a, E> {
    list: SoftErrorList<E>,
    sink: Option<Box<dyn ErrorListSink<E> + 'a>>,
}

impl<E> Drop for SoftErrorSublist<'_, E> {
    fn drop(&mut self) {
        if !self.list.is_empty() {
            let list = std::mem::take(&mut self.list);
            if let Some(sink) = self.sink.take() {
                sink.sink(list);
            }
        }
    }
}

impl<E> std::ops::Deref for SoftErrorSublist<'_, E> {
    type Target = SoftErrorList<E>;
    fn deref(&self) -> &Self::Target {
        &self.list
    }
}

impl<E> std::ops::DerefMut for SoftErrorSublist<'_, E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.list
    }
}

trait ErrorListSink<E> {
    fn sink(self: Box<Self>, list: SoftErrorList<E>);
}

struct MapPush<'a, F, TargetErr> {
    map_fn: F,
    target: &'a mut SoftErrorList<TargetErr>,
}

impl<F, SourceErr, TargetErr> ErrorListSink<SourceErr> for MapPush<'_, F, TargetErr>
where
    F: FnOnce(SoftErrorList<SourceErr>) -> TargetErr,
{
    fn sink(self: Box<Self>, list: SoftErrorList<SourceErr>) {
        let target_error = (self.map_fn)(list);
        self.target.push(target_error);
    }
}

struct SimplePush<'a, E> {
    target: &'a mut SoftErrorList<E>,
}

impl<E> ErrorListSink<E> for SimplePush<'_, E> {
    fn sink(self: Box<Self>, list: SoftErrorList<E>) {
        self.target.errors.extend(list.errors);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    enum OuterError {
        Outer,
        Middle(SoftErrorList<MiddleError>),
    }

    #[derive(Debug)]
    enum MiddleError {
        Middle,
    }

    #[test]
    fn sublist_merges_on_drop() {
        let mut soft_errors = SoftErrorList::default();
        soft_errors.push(OuterError::Outer);
        {
            let mut sub = soft_errors.map_sublist(OuterError::Middle);
            sub.push(MiddleError::Middle);
        }
        soft_errors.push(OuterError::Outer);

        let mut it = soft_errors.into_iter();
        assert!(matches!(it.next(), Some(OuterError::Outer)));
        assert!(matches!(it.next(), Some(OuterError::Middle(_))));
        assert!(matches!(it.next(), Some(OuterError::Outer)));
        assert!(it.next().is_none());
    }

    #[test]
    fn empty_sublist_does_not_push() {
        let mut soft_errors: SoftErrorList<OuterError> = SoftErrorList::default();
        {
            let _sub = soft_errors.map_sublist(OuterError::Middle);
        }
        assert!(soft_errors.is_empty());
    }
}
