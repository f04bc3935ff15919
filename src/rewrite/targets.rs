//! Names of the runtime indirection points that rewritten code calls into.
//!
//! The helpers themselves live in the host runtime. Only their internal names are needed
//! here; the method names and descriptors each helper must provide are fixed below.

/// `isRedirected(I)Z` on the field slot store.
pub const SLOT_PREDICATE: (&str, &str) = ("isRedirected", "(I)Z");
/// `getValue(Object, int) -> Object` on the field slot store.
pub const SLOT_GET: (&str, &str) = ("getValue", "(Ljava/lang/Object;I)Ljava/lang/Object;");
/// `setValue(Object, Object, int)` on the field slot store.
pub const SLOT_SET: (&str, &str) = ("setValue", "(Ljava/lang/Object;Ljava/lang/Object;I)V");
/// `isFakeField(Field) -> boolean` on the field reflection helper.
pub const FIELD_PREDICATE: (&str, &str) = ("isFakeField", "(Ljava/lang/reflect/Field;)Z");
/// `fakeCallRequired(Constructor) -> boolean` on the constructor reflection helper.
pub const CONSTRUCTOR_PREDICATE: (&str, &str) =
    ("fakeCallRequired", "(Ljava/lang/reflect/Constructor;)Z");
/// `newInstance(Constructor, Object[]) -> Object` on the constructor reflection helper.
pub const CONSTRUCTOR_INVOKE: (&str, &str) = (
    "newInstance",
    "(Ljava/lang/reflect/Constructor;[Ljava/lang/Object;)Ljava/lang/Object;",
);
/// `add(String, Object)` on the instance tracker.
pub const TRACKER_ADD: (&str, &str) = ("add", "(Ljava/lang/String;Ljava/lang/Object;)V");

/// Internal names of the helper types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTargets {
    /// Per-slot storage for redirected fields
    pub field_slots: String,
    /// Reflective field access helper
    pub field_reflection: String,
    /// Reflective constructor invocation helper
    pub constructor_reflection: String,
    /// Registry of live instances of tracked types
    pub instance_tracker: String,
}

impl Default for RuntimeTargets {
    fn default() -> Self {
        RuntimeTargets {
            field_slots: "hotswap/runtime/FieldSlots".to_string(),
            field_reflection: "hotswap/runtime/FieldReflection".to_string(),
            constructor_reflection: "hotswap/runtime/ConstructorReflection".to_string(),
            instance_tracker: "hotswap/runtime/InstanceTracker".to_string(),
        }
    }
}
