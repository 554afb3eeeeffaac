use crate::{ArrayType, Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldsLayout {
    Instance,
    Statics,
    Array(ArrayType),
}

/// Raw slot storage of an object, a class's statics, or an array.
///
/// Longs occupy two consecutive slots (low word first), references are
/// stored as their raw handle value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fields {
    values: Vec<i32>,
    layout: FieldsLayout,
}

impl Fields {
    pub fn instance(size: usize, ref_offsets: &[usize]) -> Self {
        let mut values = vec![0; size];
        for &offset in ref_offsets {
            values[offset] = Handle::NULL.raw();
        }
        Self {
            values,
            layout: FieldsLayout::Instance,
        }
    }

    pub fn statics(size: usize, ref_offsets: &[usize]) -> Self {
        Self {
            layout: FieldsLayout::Statics,
            ..Self::instance(size, ref_offsets)
        }
    }

    pub fn array(ty: ArrayType, length: usize) -> Self {
        let fill = if ty.is_reference() {
            Handle::NULL.raw()
        } else {
            0
        };
        Self {
            values: vec![fill; length * ty.slot_size()],
            layout: FieldsLayout::Array(ty),
        }
    }

    #[inline]
    pub fn layout(&self) -> FieldsLayout {
        self.layout
    }

    #[inline]
    pub fn values(&self) -> &[i32] {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn array_type(&self) -> Option<ArrayType> {
        match self.layout {
            FieldsLayout::Array(ty) => Some(ty),
            _ => None,
        }
    }

    /// Element count for arrays, 0 otherwise.
    pub fn array_length(&self) -> usize {
        self.array_type()
            .map(|ty| self.values.len() / ty.slot_size())
            .unwrap_or(0)
    }

    #[inline]
    pub fn get_int(&self, offset: usize) -> i32 {
        self.values[offset]
    }

    #[inline]
    pub fn set_int(&mut self, offset: usize, value: i32) {
        self.values[offset] = value;
    }

    pub fn get_long(&self, offset: usize) -> i64 {
        let lo = self.values[offset] as u32 as u64;
        let hi = self.values[offset + 1] as u32 as u64;
        ((hi << 32) | lo) as i64
    }

    pub fn set_long(&mut self, offset: usize, value: i64) {
        self.values[offset] = value as i32;
        self.values[offset + 1] = (value >> 32) as i32;
    }

    #[inline]
    pub fn get_ref(&self, offset: usize) -> Handle {
        Handle::from_slot(self.values[offset])
    }

    #[inline]
    pub fn set_ref(&mut self, offset: usize, value: Handle) {
        self.values[offset] = value.raw();
    }

    /// Slot offset of array element `index`, if in bounds.
    pub fn element_offset(&self, index: i32) -> Option<usize> {
        let ty = self.array_type()?;
        let index = usize::try_from(index).ok()?;
        (index < self.array_length()).then(|| index * ty.slot_size())
    }

    /// Calls `f` with the offset of every reference slot, given the owning
    /// class's reference offsets for non-array layouts.
    pub fn for_each_reference_slot(&self, ref_offsets: &[usize], mut f: impl FnMut(usize)) {
        match self.layout {
            FieldsLayout::Array(ArrayType::Reference) => (0..self.values.len()).for_each(f),
            FieldsLayout::Array(_) => {}
            FieldsLayout::Instance | FieldsLayout::Statics => {
                ref_offsets.iter().copied().for_each(&mut f)
            }
        }
    }

    /// Decodes a char array into a string.
    pub fn chars(&self) -> Option<String> {
        if self.array_type() != Some(ArrayType::Char) {
            return None;
        }
        Some(
            self.values
                .iter()
                .filter_map(|&c| char::from_u32(c as u32))
                .collect(),
        )
    }

    pub fn from_chars(text: &str) -> Self {
        Self {
            values: text.chars().map(|c| c as i32).collect(),
            layout: FieldsLayout::Array(ArrayType::Char),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longs_span_two_slots() {
        let mut fields = Fields::instance(3, &[]);
        fields.set_long(1, -5_000_000_000);
        assert_eq!(fields.get_long(1), -5_000_000_000);
        assert_eq!(fields.get_int(0), 0, "neighbouring slot untouched");
    }

    #[test]
    fn reference_slots_start_null() {
        let fields = Fields::instance(2, &[1]);
        assert_eq!(fields.get_ref(1), Handle::NULL);
        let array = Fields::array(ArrayType::Reference, 3);
        assert!(array.values().iter().all(|&v| v == Handle::NULL.raw()));
    }

    #[test]
    fn element_offsets_are_bounds_checked() {
        let array = Fields::array(ArrayType::Long, 4);
        assert_eq!(array.array_length(), 4);
        assert_eq!(array.element_offset(3), Some(6));
        assert_eq!(array.element_offset(4), None);
        assert_eq!(array.element_offset(-1), None);
    }

    #[test]
    fn char_arrays_round_trip_text() {
        let chars = Fields::from_chars("héllo");
        assert_eq!(chars.chars().as_deref(), Some("héllo"));
        assert_eq!(Fields::instance(1, &[]).chars(), None);
    }
}
