//! Interface Objects
//!
//! An [`IObj`] is an erased reference to a service: a pointer to the object
//! together with the vtable of the interface it implements. With `T` a trait
//! object type such as `dyn Mm`, the pair is exactly the fat pointer the
//! compiler builds, so calls dispatch through the vtable.
//!
//! The thread context stores its services as `IObj`s so that a service can
//! be swapped for another implementation of the same interface (the test
//! heap replacing the real one) without the callers noticing.
//!
//! ```rust,ignore
//! let mut heap = MmImpl::new();
//! let object: NonNull<dyn Mm> = NonNull::from(&mut heap);
//! let mm = IObj::new(object);
//! let block = unsafe { mm.get_mut() }.unwrap().malloc(64)?;
//! ```

use std::fmt;
use std::ptr::NonNull;

/// Object pointer plus interface vtable; null in the unset state.
pub struct IObj<T: ?Sized> {
    object: Option<NonNull<T>>,
}

impl<T: ?Sized> IObj<T> {
    /// The unset interface object.
    pub const fn null() -> Self {
        Self { object: None }
    }

    /// Wrap a pointer to an object implementing the interface.
    pub fn new(object: NonNull<T>) -> Self {
        Self {
            object: Some(object),
        }
    }

    /// Whether no object is set.
    pub fn is_null(&self) -> bool {
        self.object.is_none()
    }

    /// Reset to the unset state.
    pub fn clear(&mut self) {
        self.object = None;
    }

    /// The object pointer with its vtable.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.object
    }

    /// Address of the object, 0 if unset.
    pub fn addr(&self) -> usize {
        self.object
            .map_or(0, |object| object.as_ptr() as *const u8 as usize)
    }

    /// Whether both refer to the same object.
    pub fn same_object(&self, other: &IObj<T>) -> bool {
        self.addr() == other.addr()
    }

    /// Borrow the object.
    ///
    /// # Safety
    ///
    /// The object must be alive and not mutably borrowed elsewhere.
    pub unsafe fn get(&self) -> Option<&T> {
        self.object.map(|object| &*object.as_ptr())
    }

    /// Borrow the object mutably.
    ///
    /// # Safety
    ///
    /// The object must be alive and not borrowed elsewhere.
    pub unsafe fn get_mut(&self) -> Option<&mut T> {
        self.object.map(|object| &mut *object.as_ptr())
    }
}

impl<T: ?Sized> Clone for IObj<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for IObj<T> {}

impl<T: ?Sized> Default for IObj<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized> PartialEq for IObj<T> {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl<T: ?Sized> Eq for IObj<T> {}

impl<T: ?Sized> fmt::Debug for IObj<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IObj({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Counter {
        fn incr(&mut self) -> usize;
    }

    struct Simple(usize);

    impl Counter for Simple {
        fn incr(&mut self) -> usize {
            self.0 += 1;
            self.0
        }
    }

    struct ByTwo(usize);

    impl Counter for ByTwo {
        fn incr(&mut self) -> usize {
            self.0 += 2;
            self.0
        }
    }

    fn counter<C: Counter + 'static>(c: &mut C) -> IObj<dyn Counter> {
        let object: NonNull<dyn Counter> = NonNull::from(c);
        IObj::new(object)
    }

    #[test]
    fn test_null() {
        let obj: IObj<dyn Counter> = IObj::null();
        assert!(obj.is_null());
        assert_eq!(obj.addr(), 0);
        assert_eq!(obj, IObj::default());
        assert!(unsafe { obj.get() }.is_none());
    }

    #[test]
    fn test_dispatch_through_vtable() {
        let mut simple = Simple(0);
        let mut by_two = ByTwo(0);
        let mut obj = counter(&mut simple);
        assert_eq!(unsafe { obj.get_mut() }.unwrap().incr(), 1);

        let saved = obj;
        obj = counter(&mut by_two);
        assert_eq!(unsafe { obj.get_mut() }.unwrap().incr(), 2);
        assert_ne!(obj, saved);

        obj = saved;
        assert_eq!(unsafe { obj.get_mut() }.unwrap().incr(), 2);
        obj.clear();
        assert!(obj.is_null());
    }
}
