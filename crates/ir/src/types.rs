//! This module contains IR type definitions and their memory layout.
use std::{fmt, io};

use cranelift_entity::{entity_impl, PrimaryMap};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct TypeStore {
    compounds: PrimaryMap<CompoundTypeRef, CompoundType>,
    rev_types: FxHashMap<CompoundType, CompoundTypeRef>,
    struct_types: IndexMap<String, CompoundTypeRef>,
}

impl TypeStore {
    pub fn make_array(&mut self, elem: Type, len: usize) -> Type {
        let ty = self.make_compound(CompoundType::Array { elem, len });
        Type::Compound(ty)
    }

    pub fn make_vector(&mut self, elem: Type, len: usize) -> Type {
        let ty = self.make_compound(CompoundType::Vector { elem, len });
        Type::Compound(ty)
    }

    /// Make a named struct type.
    ///
    /// # Panic
    /// Panics if a struct with the same name but different fields already
    /// exists.
    pub fn make_struct(&mut self, name: &str, fields: &[Type], packed: bool) -> Type {
        let compound_data = CompoundType::Struct(StructData {
            name: name.to_string(),
            fields: fields.to_vec(),
            packed,
        });

        let cmpd_ref = self.make_compound(compound_data);
        Type::Compound(cmpd_ref)
    }

    /// Make a named struct type, appending a numeric suffix to `name` if the
    /// name is already taken.
    pub fn make_unique_struct(&mut self, name: &str, fields: &[Type], packed: bool) -> Type {
        if !self.struct_types.contains_key(name) {
            return self.make_struct(name, fields, packed);
        }

        let mut suffix = 1usize;
        loop {
            let candidate = format!("{name}.{suffix}");
            if !self.struct_types.contains_key(&candidate) {
                return self.make_struct(&candidate, fields, packed);
            }
            suffix += 1;
        }
    }

    /// Returns `[StructData]` if the given type is a struct type.
    pub fn struct_def(&self, ty: Type) -> Option<&StructData> {
        match ty {
            Type::Compound(cmpd_ref) => match self.compounds[cmpd_ref] {
                CompoundType::Struct(ref def) => Some(def),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn array_def(&self, ty: Type) -> Option<(Type, usize)> {
        match ty {
            Type::Compound(cmpd_ref) => match self.compounds[cmpd_ref] {
                CompoundType::Array { elem, len } => Some((elem, len)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn vector_def(&self, ty: Type) -> Option<(Type, usize)> {
        match ty {
            Type::Compound(cmpd_ref) => match self.compounds[cmpd_ref] {
                CompoundType::Vector { elem, len } => Some((elem, len)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Lookup the struct type by name.
    pub fn lookup_struct(&self, name: &str) -> Option<Type> {
        self.struct_types.get(name).copied().map(Type::Compound)
    }

    pub fn all_struct_data(&self) -> impl Iterator<Item = &StructData> {
        self.struct_types
            .values()
            .filter_map(|cmpd_ref| match &self.compounds[*cmpd_ref] {
                CompoundType::Struct(def) => Some(def),
                _ => None,
            })
    }

    pub fn is_struct(&self, ty: Type) -> bool {
        self.struct_def(ty).is_some()
    }

    pub fn is_vector(&self, ty: Type) -> bool {
        self.vector_def(ty).is_some()
    }

    /// Number of bytes occupied by a value of `ty` in memory, including the
    /// tail padding of non-packed structs.
    pub fn size_of(&self, ty: Type) -> usize {
        match ty {
            Type::Unit => 0,
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 | Type::Ptr(_) => 8,
            Type::Compound(cmpd_ref) => match &self.compounds[cmpd_ref] {
                CompoundType::Array { elem, len } => self.stride_of(*elem) * len,
                CompoundType::Vector { elem, len } => self.size_of(*elem) * len,
                CompoundType::Struct(def) => {
                    let mut offset = 0;
                    for &field in &def.fields {
                        if !def.packed {
                            offset = align_to(offset, self.align_of(field));
                        }
                        offset += self.size_of(field);
                    }
                    if def.packed {
                        offset
                    } else {
                        align_to(offset, self.align_of(ty))
                    }
                }
            },
        }
    }

    pub fn align_of(&self, ty: Type) -> usize {
        match ty {
            Type::Compound(cmpd_ref) => match &self.compounds[cmpd_ref] {
                CompoundType::Array { elem, .. } | CompoundType::Vector { elem, .. } => {
                    self.align_of(*elem)
                }
                CompoundType::Struct(def) => {
                    if def.packed {
                        1
                    } else {
                        def.fields
                            .iter()
                            .map(|field| self.align_of(*field))
                            .max()
                            .unwrap_or(1)
                    }
                }
            },
            _ => self.size_of(ty).max(1),
        }
    }

    /// Distance between two consecutive array elements of `ty`.
    pub fn stride_of(&self, ty: Type) -> usize {
        align_to(self.size_of(ty), self.align_of(ty))
    }

    /// Byte offset of the field `idx` of the struct `ty`.
    pub fn field_offset(&self, ty: Type, idx: usize) -> Option<usize> {
        let def = self.struct_def(ty)?;
        if idx >= def.fields.len() {
            return None;
        }

        let mut offset = 0;
        for (i, &field) in def.fields.iter().enumerate() {
            if !def.packed {
                offset = align_to(offset, self.align_of(field));
            }
            if i == idx {
                return Some(offset);
            }
            offset += self.size_of(field);
        }
        None
    }

    /// Computes the byte offset addressed by a GEP over `elem_ty` with
    /// constant `indices`, together with the type of the addressed element.
    ///
    /// The first index scales by the size of `elem_ty`; the following ones
    /// step into aggregates.
    pub fn gep_offset(&self, elem_ty: Type, indices: &[i64]) -> Option<(i64, Type)> {
        let (&first, rest) = indices.split_first()?;
        let mut offset = first.checked_mul(self.stride_of(elem_ty) as i64)?;
        let mut current = elem_ty;

        for &idx in rest {
            let cmpd_ref = match current {
                Type::Compound(cmpd_ref) => cmpd_ref,
                _ => return None,
            };
            match &self.compounds[cmpd_ref] {
                CompoundType::Struct(def) => {
                    let field_idx = usize::try_from(idx).ok()?;
                    let field = *def.fields.get(field_idx)?;
                    offset += self.field_offset(current, field_idx)? as i64;
                    current = field;
                }
                CompoundType::Array { elem, .. } | CompoundType::Vector { elem, .. } => {
                    offset += idx.checked_mul(self.stride_of(*elem) as i64)?;
                    current = *elem;
                }
            }
        }

        Some((offset, current))
    }

    pub fn make_compound(&mut self, data: CompoundType) -> CompoundTypeRef {
        match self.rev_types.get(&data) {
            Some(cmpd_ref) => *cmpd_ref,
            None => {
                let cmpd_ref = self.compounds.push(data.clone());
                if let CompoundType::Struct(s) = &data {
                    let name = &s.name;
                    assert!(
                        !self.struct_types.contains_key(name),
                        "struct {name} is already defined"
                    );
                    self.struct_types.insert(name.to_string(), cmpd_ref);
                }

                self.rev_types.insert(data, cmpd_ref);
                cmpd_ref
            }
        }
    }

    pub fn resolve_compound(&self, cmpd_ref: CompoundTypeRef) -> &CompoundType {
        &self.compounds[cmpd_ref]
    }

    /// Returns a textual description of `ty`, e.g. `[i32; 4]` or `%Frame`.
    pub fn display(&self, ty: Type) -> String {
        let mut s = Vec::new();
        // Writing into a `Vec` never fails.
        let _ = self.write_ty(ty, &mut s);
        String::from_utf8_lossy(&s).into_owned()
    }

    pub fn write_ty(&self, ty: Type, w: &mut impl io::Write) -> io::Result<()> {
        match ty {
            Type::Compound(cmpd_ref) => match &self.compounds[cmpd_ref] {
                CompoundType::Array { elem, len } => {
                    write!(w, "[")?;
                    self.write_ty(*elem, w)?;
                    write!(w, "; {len}]")
                }
                CompoundType::Vector { elem, len } => {
                    write!(w, "<")?;
                    self.write_ty(*elem, w)?;
                    write!(w, " x {len}>")
                }
                CompoundType::Struct(def) => write!(w, "%{}", def.name),
            },
            _ => write!(w, "{ty}"),
        }
    }
}

pub fn align_to(value: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

/// Address space of a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum AddrSpace {
    /// Per-lane private memory. Allocas in this space are promoted to
    /// registers by the backend.
    #[default]
    Private,
    /// Global memory. The software stack lives here.
    Global,
    /// Read-only memory such as shader records and dispatch globals.
    Constant,
}

/// IR types definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr(AddrSpace),
    Compound(CompoundTypeRef),
    #[default]
    Unit,
}

impl Type {
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Self::I1 | Self::I8 | Self::I16 | Self::I32 | Self::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, Self::Ptr(_))
    }

    pub fn is_compound(self) -> bool {
        matches!(self, Type::Compound(_))
    }

    pub fn is_unit(self) -> bool {
        matches!(self, Self::Unit)
    }

    pub fn addr_space(self) -> Option<AddrSpace> {
        match self {
            Self::Ptr(space) => Some(space),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I1 => write!(f, "i1"),
            Self::I8 => write!(f, "i8"),
            Self::I16 => write!(f, "i16"),
            Self::I32 => write!(f, "i32"),
            Self::I64 => write!(f, "i64"),
            Self::F32 => write!(f, "f32"),
            Self::F64 => write!(f, "f64"),
            Self::Ptr(AddrSpace::Private) => write!(f, "ptr"),
            Self::Ptr(AddrSpace::Global) => write!(f, "gptr"),
            Self::Ptr(AddrSpace::Constant) => write!(f, "cptr"),
            Self::Compound(cmpd_ref) => write!(f, "{cmpd_ref}"),
            Self::Unit => write!(f, "unit"),
        }
    }
}

/// An opaque reference to [`CompoundType`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct CompoundTypeRef(u32);
entity_impl!(CompoundTypeRef, "ty");

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompoundType {
    Array { elem: Type, len: usize },
    Vector { elem: Type, len: usize },
    Struct(StructData),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructData {
    pub name: String,
    pub fields: Vec<Type>,
    pub packed: bool,
}
