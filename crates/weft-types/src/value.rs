use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::error::RoutineError;

/// Dynamically typed value routed between strands.
///
/// Broadcast payloads, routine results and race outcomes all travel as
/// `Value`. The payload is reference-counted so that one broadcast can fan
/// out to any number of receivers without copying; the concrete type name is
/// captured at construction for diagnostics.
#[derive(Clone)]
pub struct Value {
    inner: Rc<dyn Any>,
    type_name: &'static str,
}

impl Value {
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            inner: Rc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The `()` payload, delivered by broadcasts that carry no data.
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Wrap a result produced off-loop by a blocking task.
    pub fn from_boxed(value: Box<dyn Any + Send>) -> Self {
        let value: Box<dyn Any> = value;
        Self {
            inner: Rc::from(value),
            type_name: "<blocking task result>",
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn is_unit(&self) -> bool {
        self.is::<()>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Clone the payload out as `T`, or `None` on a type mismatch.
    pub fn downcast<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Move the payload out as `T`. Fails on a type mismatch or when other
    /// clones of this value are still alive (fan-out payloads are shared).
    pub fn take<T: Any>(self) -> Result<T, RoutineError> {
        let got = self.type_name;
        let want = std::any::type_name::<T>();
        match self.inner.downcast::<T>() {
            Ok(rc) => Rc::try_unwrap(rc)
                .map_err(|_| RoutineError::new(format!("value of type {want} is still shared"))),
            Err(_) => Err(RoutineError::new(format!(
                "expected a value of type {want}, got {got}"
            ))),
        }
    }

    /// Concrete type name captured at construction.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>", self.type_name)
    }
}
