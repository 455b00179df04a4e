use std::cmp::max;
use std::collections::BTreeMap;

use super::align;

// Appended data is kept as a list of alignment slices rather than a flat
// buffer, because the padding an alignment needs depends on where the
// enclosing data finally lands. Array lengths are backfilled in `complete`.

pub(crate) struct MessageBuilder {
    data: Vec<MessageComponent>, // Invariant: top one is always an alignment slice
    next_token: usize,
}

fn align_vec(vec: &mut Vec<u8>, alignment: usize) {
    vec.resize(align(vec.len(), alignment), 0);
}

#[derive(Debug, Clone, PartialEq)]
struct AlignmentSlice {
    alignment: usize,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LengthToken(usize);

#[derive(Debug, Clone, PartialEq)]
enum MessageComponent {
    AlignmentSlice(AlignmentSlice),
    LengthBegin(LengthToken),
    LengthEnd(LengthToken),
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    pub(crate) fn new() -> Self {
        Self {
            data: vec![MessageComponent::AlignmentSlice(AlignmentSlice {
                alignment: 1usize,
                data: Vec::new(),
            })],
            next_token: 0,
        }
    }

    fn top(&mut self) -> &mut AlignmentSlice {
        if !matches!(self.data.last(), Some(MessageComponent::AlignmentSlice(_))) {
            self.push_slice(1);
        }
        match self.data.last_mut() {
            Some(MessageComponent::AlignmentSlice(a_slice)) => a_slice,
            _ => unreachable!("top message component must always be an alignment slice"),
        }
    }

    fn push_slice(&mut self, alignment: usize) {
        self.data
            .push(MessageComponent::AlignmentSlice(AlignmentSlice {
                alignment,
                data: Vec::new(),
            }));
    }

    /// Writes a placeholder array length. Everything appended until the
    /// matching [`finish_length`](Self::finish_length) is counted into it,
    /// except the padding that directly follows the length itself.
    pub(crate) fn start_length(&mut self) -> LengthToken {
        let token = LengthToken(self.next_token);
        self.next_token += 1;
        self.align(4);
        self.data.push(MessageComponent::LengthBegin(token));
        self.push_slice(1);
        token
    }

    pub(crate) fn finish_length(&mut self, token: LengthToken) {
        self.data.push(MessageComponent::LengthEnd(token));
        self.push_slice(1);
    }

    // Note: alignment must be power of 2
    pub(crate) fn align(&mut self, alignment: usize) {
        {
            let top = self.top();
            if top.data.is_empty() {
                // An empty segment can still take on a stricter alignment.
                top.alignment = max(top.alignment, alignment);
                return;
            } else if top.alignment >= alignment {
                align_vec(&mut top.data, alignment);
                return;
            }
        }

        // Data already written cannot be aligned more strictly, so the
        // padding is decided when the message is completed.
        self.push_slice(alignment);
    }

    pub(crate) fn prepare_write(&mut self, size: usize) -> &mut [u8] {
        let top = self.top();
        let old_len = top.data.len();
        let new_len = old_len + size;
        top.data.resize(new_len, 0);
        &mut top.data[old_len..new_len]
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.prepare_write(bytes.len()).copy_from_slice(bytes);
    }

    pub(crate) fn complete(self) -> Vec<u8> {
        let mut output_data = Vec::new();

        // Open arrays: token -> (length field offset, first element offset)
        let mut lengths: BTreeMap<usize, (usize, usize)> = BTreeMap::new();

        // An array whose first element offset is not known yet, because
        // the padding in front of it has not been written.
        let mut recent_length = None;

        for datum in self.data {
            match datum {
                MessageComponent::AlignmentSlice(mut a_slice) => {
                    align_vec(&mut output_data, a_slice.alignment);

                    if let Some(recent_length) = recent_length.take() {
                        if let Some(length_item) = lengths.get_mut(&recent_length) {
                            length_item.1 = output_data.len();
                        }
                    }

                    output_data.append(&mut a_slice.data);
                }
                MessageComponent::LengthBegin(LengthToken(token)) => {
                    lengths.insert(token, (output_data.len(), output_data.len() + 4));
                    output_data.extend_from_slice(&[0u8, 0u8, 0u8, 0u8]);
                    recent_length = Some(token);
                }
                MessageComponent::LengthEnd(LengthToken(token)) => {
                    if let Some((fill_ix, begin_ix)) = lengths.remove(&token) {
                        let length = (output_data.len() - begin_ix) as u32;
                        output_data[fill_ix..fill_ix + 4].copy_from_slice(&length.to_le_bytes());
                    }
                    recent_length = None;
                }
            }
        }

        output_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn backfills_array_length() {
        let mut builder = MessageBuilder::new();
        let token = builder.start_length();
        builder.align(4);
        builder.write_bytes(&7u32.to_le_bytes());
        builder.write_bytes(&9u32.to_le_bytes());
        builder.finish_length(token);
        assert_eq!(
            builder.complete(),
            vec![8, 0, 0, 0, 7, 0, 0, 0, 9, 0, 0, 0]
        );
    }

    #[test]
    fn padding_after_length_is_not_counted() {
        let mut builder = MessageBuilder::new();
        let token = builder.start_length();
        builder.align(8);
        builder.write_bytes(&[1u8; 8]);
        builder.finish_length(token);
        let data = builder.complete();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[0..4], &8u32.to_le_bytes());
        assert_eq!(&data[8..16], &[1u8; 8]);
    }

    #[test]
    fn empty_array_keeps_element_padding() {
        let mut builder = MessageBuilder::new();
        builder.write_bytes(&[0xff]);
        let token = builder.start_length();
        builder.align(8);
        builder.finish_length(token);
        let data = builder.complete();
        assert_eq!(data, vec![0xff, 0, 0, 0, 0, 0, 0, 0]);
    }
}
