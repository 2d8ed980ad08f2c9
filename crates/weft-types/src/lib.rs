pub mod effect;
pub mod error;
pub mod routine;
pub mod strand;
pub mod value;

pub use effect::{
    BlockingFn, CancelHook, Effect, EffectKind, EffectParts, EffectPredicate, Intercepted,
    ReceivePredicate,
};
pub use error::{RoutineError, RuntimeFault};
pub use routine::{Ctx, EffectCell, Perform, RoutineFn, RoutineFuture, RoutineResult, Typed};
pub use strand::{Strand, StrandId, StrandShared};
pub use value::Value;
