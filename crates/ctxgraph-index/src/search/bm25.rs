//! BM25 keyword scoring over chunk text

use std::collections::{BTreeMap, HashMap, HashSet};

use super::tokenize;

/// BM25 parameters
const K1: f64 = 1.2; // Term frequency saturation
const B: f64 = 0.75; // Length normalization

/// A tokenized document
#[derive(Debug, Clone)]
struct Document {
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// A keyword hit with its raw BM25 score and the share of query terms it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub id: String,
    pub score: f64,
    /// Matched distinct query terms / distinct query terms, in (0, 1]
    pub coverage: f64,
}

/// BM25 search index
#[derive(Debug, Clone, Default)]
pub struct BM25Index {
    documents: BTreeMap<String, Document>,
    /// Number of documents containing each term
    doc_freqs: HashMap<String, usize>,
    total_length: usize,
}

impl BM25Index {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document, replacing any previous document with the same id
    pub fn add_document(&mut self, id: impl Into<String>, text: &str) {
        let id = id.into();
        self.remove_document(&id);

        let tokens = tokenize(text);
        let length = tokens.len();
        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        for token in tokens {
            *term_freqs.entry(token).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }

        self.total_length += length;
        self.documents.insert(id, Document { term_freqs, length });
    }

    /// Remove a document from the index
    pub fn remove_document(&mut self, id: &str) -> bool {
        let Some(doc) = self.documents.remove(id) else {
            return false;
        };

        self.total_length -= doc.length;
        for term in doc.term_freqs.keys() {
            if let Some(count) = self.doc_freqs.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.doc_freqs.remove(term);
                }
            }
        }
        true
    }

    fn avg_doc_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    /// Calculate IDF for a term
    fn calculate_idf(&self, term: &str) -> f64 {
        let doc_freq = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        if doc_freq == 0.0 {
            return 0.0;
        }

        let n = self.documents.len() as f64;
        ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln()
    }

    fn score_document(&self, doc: &Document, query_terms: &[String], avg_len: f64) -> (f64, usize) {
        let mut score = 0.0;
        let mut matched = 0;

        for term in query_terms {
            let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
            if tf > 0.0 {
                matched += 1;
                let idf = self.calculate_idf(term);
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc.length as f64 / avg_len));
                score += idf * (numerator / denominator);
            }
        }

        (score, matched)
    }

    /// Score every matching document.
    ///
    /// Ordered by score descending, then id ascending. Documents that share no
    /// term with the query are omitted.
    pub fn search(&self, query: &str, limit: usize) -> Vec<KeywordHit> {
        let mut seen = HashSet::new();
        let query_terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();

        if query_terms.is_empty() || self.documents.is_empty() {
            return Vec::new();
        }

        let avg_len = self.avg_doc_length().max(1.0);
        let mut hits: Vec<KeywordHit> = self
            .documents
            .iter()
            .filter_map(|(id, doc)| {
                let (score, matched) = self.score_document(doc, &query_terms, avg_len);
                (matched > 0 && score > 0.0).then(|| KeywordHit {
                    id: id.clone(),
                    score,
                    coverage: matched as f64 / query_terms.len() as f64,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        hits
    }

    /// Get the number of documents in the index
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
