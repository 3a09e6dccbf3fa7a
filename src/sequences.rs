//! Token history of every decoding row.

/// Double-buffered token ids with shape `(batch_beam_size, max_length)`.
///
/// Beam search moves histories between rows when a beam continues from a
/// different parent. Reordering reads the current buffer and writes the
/// other one, then swaps them, so no row is overwritten before it has been
/// read.
#[derive(Clone, Debug)]
pub struct Sequences {
    buffers: [Vec<i32>; 2],
    current: usize,
    batch_beam_size: usize,
    max_length: usize,
    length: usize,
}

impl Sequences {
    /// Create sequences from `(batch_size, prompt_len)` prompt ids, copying
    /// each prompt into all `num_beams` rows of its batch entry.
    pub fn new(
        input_ids: &[i32],
        batch_size: usize,
        num_beams: usize,
        max_length: usize,
    ) -> Sequences {
        assert!(batch_size > 0 && num_beams > 0);
        assert_eq!(input_ids.len() % batch_size, 0);
        let prompt_len = input_ids.len() / batch_size;
        assert!(prompt_len <= max_length, "prompt is longer than max_length");

        let batch_beam_size = batch_size * num_beams;
        let mut data = vec![0; batch_beam_size * max_length];
        for (row, seq) in data.chunks_exact_mut(max_length).enumerate() {
            let batch = row / num_beams;
            seq[..prompt_len].copy_from_slice(&input_ids[batch * prompt_len..][..prompt_len]);
        }

        Sequences {
            buffers: [data, vec![0; batch_beam_size * max_length]],
            current: 0,
            batch_beam_size,
            max_length,
            length: prompt_len,
        }
    }

    pub fn batch_beam_size(&self) -> usize {
        self.batch_beam_size
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of tokens in every row, including the prompt.
    pub fn sequence_length(&self) -> usize {
        self.length
    }

    pub fn is_full(&self) -> bool {
        self.length == self.max_length
    }

    /// Tokens of `row` generated so far.
    pub fn sequence(&self, row: usize) -> &[i32] {
        let start = row * self.max_length;
        &self.buffers[self.current][start..start + self.length]
    }

    /// Write `tokens[row]` into column `sequence_length` of every row.
    pub fn append_next_tokens(&mut self, tokens: &[i32]) {
        assert_eq!(tokens.len(), self.batch_beam_size);
        assert!(!self.is_full(), "sequences are full");

        let col = self.length;
        for (seq, &token) in self.buffers[self.current]
            .chunks_exact_mut(self.max_length)
            .zip(tokens)
        {
            seq[col] = token;
        }
        self.length += 1;
    }

    /// Replace each row's history with that of `parents[row]`, then append
    /// `tokens[row]`.
    pub fn append_reordered(&mut self, parents: &[usize], tokens: &[i32]) {
        assert_eq!(parents.len(), self.batch_beam_size);
        assert_eq!(tokens.len(), self.batch_beam_size);
        assert!(!self.is_full(), "sequences are full");

        let (len, max_len) = (self.length, self.max_length);
        let [a, b] = &mut self.buffers;
        let (src, dst) = if self.current == 0 { (&*a, b) } else { (&*b, a) };

        for ((seq, &parent), &token) in dst.chunks_exact_mut(max_len).zip(parents).zip(tokens) {
            let parent_seq = &src[parent * max_len..][..len];
            seq[..len].copy_from_slice(parent_seq);
            seq[len] = token;
        }

        self.current = 1 - self.current;
        self.length += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::Sequences;

    #[test]
    fn test_prompt_is_copied_to_every_beam() {
        let seqs = Sequences::new(&[1, 2, 3, 4], 2, 2, 5);
        assert_eq!(seqs.batch_beam_size(), 4);
        assert_eq!(seqs.sequence_length(), 2);
        assert_eq!(seqs.sequence(0), &[1, 2]);
        assert_eq!(seqs.sequence(1), &[1, 2]);
        assert_eq!(seqs.sequence(2), &[3, 4]);
        assert_eq!(seqs.sequence(3), &[3, 4]);
    }

    #[test]
    fn test_append() {
        let mut seqs = Sequences::new(&[1, 2], 2, 1, 3);
        seqs.append_next_tokens(&[7, 8]);
        assert_eq!(seqs.sequence(0), &[1, 7]);
        assert_eq!(seqs.sequence(1), &[2, 8]);
        assert!(!seqs.is_full());
    }

    #[test]
    fn test_append_reordered() {
        let mut seqs = Sequences::new(&[5], 1, 3, 4);
        seqs.append_next_tokens(&[1, 2, 3]);

        // Row 0 continues beam 2 and rows 1 and 2 both continue beam 0.
        seqs.append_reordered(&[2, 0, 0], &[10, 11, 12]);
        assert_eq!(seqs.sequence(0), &[5, 3, 10]);
        assert_eq!(seqs.sequence(1), &[5, 1, 11]);
        assert_eq!(seqs.sequence(2), &[5, 1, 12]);

        seqs.append_reordered(&[1, 1, 2], &[20, 21, 22]);
        assert_eq!(seqs.sequence(0), &[5, 1, 11, 20]);
        assert_eq!(seqs.sequence(1), &[5, 1, 11, 21]);
        assert_eq!(seqs.sequence(2), &[5, 1, 12, 22]);
        assert!(seqs.is_full());
    }

    #[test]
    #[should_panic(expected = "sequences are full")]
    fn test_append_when_full() {
        let mut seqs = Sequences::new(&[1, 2], 1, 1, 2);
        seqs.append_next_tokens(&[3]);
    }
}
