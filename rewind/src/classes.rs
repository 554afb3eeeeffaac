use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{ClassId, EngineError, Fields, Handle, MethodId, MethodInfo};

pub const OBJECT: &str = "Object";
pub const THREAD: &str = "Thread";
pub const STRING: &str = "String";
pub const WEAK_REFERENCE: &str = "WeakReference";
pub const THROWABLE: &str = "Throwable";
pub const OUT_OF_MEMORY_ERROR: &str = "OutOfMemoryError";
pub const STACK_OVERFLOW_ERROR: &str = "StackOverflowError";
pub const ILLEGAL_MONITOR_STATE: &str = "IllegalMonitorStateException";
pub const INTERRUPTED_EXCEPTION: &str = "InterruptedException";
pub const ILLEGAL_THREAD_STATE: &str = "IllegalThreadStateException";
pub const NULL_POINTER_EXCEPTION: &str = "NullPointerException";
pub const ARITHMETIC_EXCEPTION: &str = "ArithmeticException";
pub const ASSERTION_ERROR: &str = "AssertionError";
pub const ARRAY_INDEX_OUT_OF_BOUNDS: &str = "ArrayIndexOutOfBoundsException";
pub const NEGATIVE_ARRAY_SIZE: &str = "NegativeArraySizeException";

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Long,
    Reference,
}

impl FieldType {
    #[inline]
    pub fn slot_size(self) -> usize {
        match self {
            FieldType::Long => 2,
            _ => 1,
        }
    }
}

/// Layout entry of one declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub offset: usize,
    /// Storage size in slots, 1 or 2.
    pub size: usize,
    pub is_reference: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayType {
    Int,
    Long,
    Char,
    Reference,
}

impl ArrayType {
    pub const ALL: [ArrayType; 4] = [
        ArrayType::Int,
        ArrayType::Long,
        ArrayType::Char,
        ArrayType::Reference,
    ];

    #[inline]
    pub fn slot_size(self) -> usize {
        match self {
            ArrayType::Long => 2,
            _ => 1,
        }
    }

    #[inline]
    pub fn is_reference(self) -> bool {
        self == ArrayType::Reference
    }

    pub fn class_name(self) -> &'static str {
        match self {
            ArrayType::Int => "[I",
            ArrayType::Long => "[J",
            ArrayType::Char => "[C",
            ArrayType::Reference => "[L",
        }
    }
}

/// What the core needs to know about a class beyond its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Plain,
    Thread,
    /// The slot at `referent_offset` is not traced by the collector.
    WeakReference { referent_offset: usize },
    Throwable,
}

/// Hook run on an instance right before the collector frees it.
pub trait ReleaseAction: fmt::Debug + Send + Sync {
    fn release(&self, handle: Handle, fields: &Fields);
}

#[derive(Debug)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    pub interfaces: Vec<String>,
    pub instance_fields: Vec<FieldInfo>,
    pub static_fields: Vec<FieldInfo>,
    pub instance_size: usize,
    pub static_size: usize,
    instance_refs: Vec<usize>,
    static_refs: Vec<usize>,
    pub array_type: Option<ArrayType>,
    pub kind: ClassKind,
    pub release_actions: Vec<Arc<dyn ReleaseAction>>,
}

impl ClassInfo {
    pub fn instance_field(&self, name: &str) -> Option<&FieldInfo> {
        // subclass fields shadow inherited ones
        self.instance_fields.iter().rev().find(|f| f.name == name)
    }

    pub fn static_field(&self, name: &str) -> Option<&FieldInfo> {
        self.static_fields.iter().find(|f| f.name == name)
    }

    /// Offsets of reference-valued instance slots.
    #[inline]
    pub fn instance_reference_offsets(&self) -> &[usize] {
        &self.instance_refs
    }

    #[inline]
    pub fn static_reference_offsets(&self) -> &[usize] {
        &self.static_refs
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.array_type.is_some()
    }

    /// Reference slot the collector must skip, if any.
    #[inline]
    pub fn weak_referent_offset(&self) -> Option<usize> {
        match self.kind {
            ClassKind::WeakReference { referent_offset } => Some(referent_offset),
            _ => None,
        }
    }
}

/// Declaration handed to [`ClassRegistry::define`]. Field offsets are
/// assigned by the registry, after the inherited ones.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<(String, FieldType)>,
    pub static_fields: Vec<(String, FieldType)>,
    pub kind: Option<ClassKind>,
    pub release_actions: Vec<Arc<dyn ReleaseAction>>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: Some(OBJECT.to_owned()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            static_fields: Vec::new(),
            kind: None,
            release_actions: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    pub fn static_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.static_fields.push((name.into(), ty));
        self
    }

    pub fn kind(mut self, kind: ClassKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn on_release(mut self, action: Arc<dyn ReleaseAction>) -> Self {
        self.release_actions.push(action);
        self
    }
}

#[derive(Debug, Default)]
struct RegistryImpl {
    classes: Vec<Arc<ClassInfo>>,
    class_ids: HashMap<String, ClassId, ahash::RandomState>,
    methods: Vec<Arc<MethodInfo>>,
    method_ids: HashMap<String, MethodId, ahash::RandomState>,
}

/// Classes and methods of the program under test.
///
/// Cloning is cheap and every clone sees the same table. The registry is
/// filled before the search starts and only read afterwards, so independent
/// search workers may share one.
#[derive(Debug, Clone)]
pub struct ClassRegistry(Arc<RwLock<RegistryImpl>>);

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    pub fn new() -> Self {
        let registry = Self(Arc::new(RwLock::new(RegistryImpl::default())));
        registry.bootstrap();
        registry
    }

    fn bootstrap(&self) {
        let mut inner = self.0.write();
        let object = ClassDef {
            superclass: None,
            ..ClassDef::new(OBJECT)
        };
        let bootstrap = [
            object,
            ClassDef::new(THREAD)
                .field("target", FieldType::Reference)
                .field("priority", FieldType::Int)
                .kind(ClassKind::Thread),
            ClassDef::new(STRING).field("value", FieldType::Reference),
            ClassDef::new(WEAK_REFERENCE)
                .field("referent", FieldType::Reference)
                .kind(ClassKind::WeakReference { referent_offset: 0 }),
            ClassDef::new(THROWABLE)
                .field("message", FieldType::Reference)
                .field("cause", FieldType::Reference)
                .kind(ClassKind::Throwable),
            ClassDef::new(OUT_OF_MEMORY_ERROR).extends(THROWABLE),
            ClassDef::new(STACK_OVERFLOW_ERROR).extends(THROWABLE),
            ClassDef::new(ILLEGAL_MONITOR_STATE).extends(THROWABLE),
            ClassDef::new(INTERRUPTED_EXCEPTION).extends(THROWABLE),
            ClassDef::new(ILLEGAL_THREAD_STATE).extends(THROWABLE),
            ClassDef::new(NULL_POINTER_EXCEPTION).extends(THROWABLE),
            ClassDef::new(ARITHMETIC_EXCEPTION).extends(THROWABLE),
            ClassDef::new(ASSERTION_ERROR).extends(THROWABLE),
            ClassDef::new(ARRAY_INDEX_OUT_OF_BOUNDS).extends(THROWABLE),
            ClassDef::new(NEGATIVE_ARRAY_SIZE).extends(THROWABLE),
        ];
        for def in bootstrap {
            // the bootstrap set is well formed, a failure here is a typo above
            if let Err(err) = inner.define(def) {
                log::error!("bootstrap class rejected: {err}");
            }
        }
        for ty in ArrayType::ALL {
            inner.define_array(ty);
        }
    }

    pub fn define(&self, def: ClassDef) -> Result<ClassId, EngineError> {
        self.0.write().define(def)
    }

    pub fn class(&self, id: ClassId) -> Option<Arc<ClassInfo>> {
        self.0.read().classes.get(id.index()).cloned()
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.0.read().class_ids.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<ClassInfo>, EngineError> {
        let inner = self.0.read();
        inner
            .class_ids
            .get(name)
            .and_then(|id| inner.classes.get(id.index()))
            .cloned()
            .ok_or_else(|| EngineError::UnknownClass(name.to_owned()))
    }

    pub fn array_class(&self, ty: ArrayType) -> Result<Arc<ClassInfo>, EngineError> {
        self.by_name(ty.class_name())
    }

    pub fn class_count(&self) -> usize {
        self.0.read().classes.len()
    }

    /// Walks the superclass chain of `sub`. Interfaces are matched by name.
    pub fn is_subclass_of(&self, sub: ClassId, sup: ClassId) -> bool {
        let inner = self.0.read();
        let Some(target) = inner.classes.get(sup.index()) else {
            return false;
        };
        let mut current = Some(sub);
        while let Some(id) = current {
            if id == sup {
                return true;
            }
            let Some(class) = inner.classes.get(id.index()) else {
                return false;
            };
            if class.interfaces.iter().any(|i| *i == target.name) {
                return true;
            }
            current = class.superclass;
        }
        false
    }

    /// Installs `method` under its name and assigns its id.
    pub fn register_method(&self, mut method: MethodInfo) -> Arc<MethodInfo> {
        let mut inner = self.0.write();
        let id = MethodId(inner.methods.len() as u32);
        method.id = id;
        let method = Arc::new(method);
        inner.method_ids.insert(method.name.clone(), id);
        inner.methods.push(Arc::clone(&method));
        method
    }

    pub fn method(&self, id: MethodId) -> Option<Arc<MethodInfo>> {
        self.0.read().methods.get(id.0 as usize).cloned()
    }

    pub fn method_by_name(&self, name: &str) -> Result<Arc<MethodInfo>, EngineError> {
        let inner = self.0.read();
        inner
            .method_ids
            .get(name)
            .and_then(|id| inner.methods.get(id.0 as usize))
            .cloned()
            .ok_or_else(|| EngineError::UnknownMethod(name.to_owned()))
    }
}

impl RegistryImpl {
    fn define(&mut self, def: ClassDef) -> Result<ClassId, EngineError> {
        if self.class_ids.contains_key(&def.name) {
            return Err(EngineError::Inconsistent(format!(
                "class `{}` defined twice",
                def.name
            )));
        }
        let superclass = match &def.superclass {
            Some(name) => Some(
                self.class_ids
                    .get(name)
                    .copied()
                    .ok_or_else(|| EngineError::UnknownClass(name.clone()))?,
            ),
            None => None,
        };
        let parent = superclass.and_then(|id| self.classes.get(id.index()));

        let mut instance_fields = parent
            .map(|p| p.instance_fields.clone())
            .unwrap_or_default();
        let mut instance_size = parent.map(|p| p.instance_size).unwrap_or(0);
        for (name, ty) in &def.fields {
            instance_fields.push(FieldInfo {
                name: name.clone(),
                offset: instance_size,
                size: ty.slot_size(),
                is_reference: *ty == FieldType::Reference,
            });
            instance_size += ty.slot_size();
        }

        let mut static_fields = Vec::with_capacity(def.static_fields.len());
        let mut static_size = 0;
        for (name, ty) in &def.static_fields {
            static_fields.push(FieldInfo {
                name: name.clone(),
                offset: static_size,
                size: ty.slot_size(),
                is_reference: *ty == FieldType::Reference,
            });
            static_size += ty.slot_size();
        }

        let kind = def
            .kind
            .or_else(|| parent.map(|p| p.kind))
            .unwrap_or(ClassKind::Plain);
        let mut release_actions = parent
            .map(|p| p.release_actions.clone())
            .unwrap_or_default();
        release_actions.extend(def.release_actions);

        let id = ClassId(self.classes.len() as u32);
        let class = ClassInfo {
            id,
            instance_refs: reference_offsets(&instance_fields),
            static_refs: reference_offsets(&static_fields),
            name: def.name,
            superclass,
            interfaces: def.interfaces,
            instance_fields,
            static_fields,
            instance_size,
            static_size,
            array_type: None,
            kind,
            release_actions,
        };
        self.class_ids.insert(class.name.clone(), id);
        self.classes.push(Arc::new(class));
        Ok(id)
    }

    fn define_array(&mut self, ty: ArrayType) {
        let id = ClassId(self.classes.len() as u32);
        let class = ClassInfo {
            id,
            name: ty.class_name().to_owned(),
            superclass: self.class_ids.get(OBJECT).copied(),
            interfaces: Vec::new(),
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            instance_size: 0,
            static_size: 0,
            instance_refs: Vec::new(),
            static_refs: Vec::new(),
            array_type: Some(ty),
            kind: ClassKind::Plain,
            release_actions: Vec::new(),
        };
        self.class_ids.insert(class.name.clone(), id);
        self.classes.push(Arc::new(class));
    }
}

fn reference_offsets(fields: &[FieldInfo]) -> Vec<usize> {
    fields
        .iter()
        .filter(|f| f.is_reference)
        .map(|f| f.offset)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_defines_system_classes() {
        let registry = ClassRegistry::new();
        for name in [OBJECT, THREAD, STRING, WEAK_REFERENCE, OUT_OF_MEMORY_ERROR] {
            assert!(registry.class_id(name).is_some(), "{name} should exist");
        }
        let weak = registry.by_name(WEAK_REFERENCE).unwrap();
        assert_eq!(weak.weak_referent_offset(), Some(0));
        assert!(registry.array_class(ArrayType::Char).unwrap().is_array());
    }

    #[test]
    fn subclass_fields_follow_inherited_layout() {
        let registry = ClassRegistry::new();
        registry
            .define(ClassDef::new("Node").field("value", FieldType::Long))
            .unwrap();
        let id = registry
            .define(
                ClassDef::new("LinkedNode")
                    .extends("Node")
                    .field("next", FieldType::Reference),
            )
            .unwrap();
        let class = registry.class(id).unwrap();
        assert_eq!(class.instance_size, 3);
        let next = class.instance_field("next").unwrap();
        assert_eq!(next.offset, 2, "next follows the two-slot long");
        assert_eq!(class.instance_reference_offsets(), &[2]);
    }

    #[test]
    fn throwable_hierarchy_is_walked() {
        let registry = ClassRegistry::new();
        let oom = registry.class_id(OUT_OF_MEMORY_ERROR).unwrap();
        let throwable = registry.class_id(THROWABLE).unwrap();
        let thread = registry.class_id(THREAD).unwrap();
        assert!(registry.is_subclass_of(oom, throwable));
        assert!(!registry.is_subclass_of(thread, throwable));
        assert_eq!(
            registry.class(oom).unwrap().kind,
            ClassKind::Throwable,
            "kind is inherited"
        );
    }

    #[test]
    fn unknown_superclass_is_rejected() {
        let registry = ClassRegistry::new();
        let err = registry
            .define(ClassDef::new("Orphan").extends("Missing"))
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownClass("Missing".into()));
    }
}
