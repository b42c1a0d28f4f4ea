use regex::bytes::{RegexSet, RegexSetBuilder};

use uf_interface::{AdfDatabase, AppId, Error, Result};

/// Compiled multi-pattern detection database.
///
/// Patterns are compiled together in block mode with DOTALL semantics; a
/// scan reports the first pattern (in compilation order) that matches and
/// stops there, the caller never needs the full match set. Scan state is
/// per call, so one database can serve any number of workers concurrently.
#[derive(Debug)]
pub struct AdfDb {
    set: RegexSet,
    ids: Vec<AppId>,
    sources: Vec<String>,
}

impl AdfDb {
    pub fn compile(patterns: &[(AppId, String)]) -> Result<AdfDb> {
        if patterns.is_empty() {
            return Err(Error::NotFound);
        }

        let sources: Vec<String> = patterns.iter().map(|(_, p)| p.clone()).collect();
        let set = RegexSetBuilder::new(&sources)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| Error::Compile(e.to_string()))?;

        Ok(AdfDb {
            set,
            ids: patterns.iter().map(|(id, _)| *id).collect(),
            sources,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl AdfDatabase for AdfDb {
    fn scan(&self, data: &[u8]) -> Option<AppId> {
        let first = self.set.matches(data).iter().next()?;
        Some(self.ids[first])
    }

    fn patterns(&self) -> Vec<(AppId, String)> {
        self.ids
            .iter()
            .copied()
            .zip(self.sources.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_reports_first_matching_pattern() {
        let db = AdfDb::compile(&[
            (7, "^/video".into()),
            (9, "^/v".into()),
        ])
        .unwrap();

        // Both patterns match; the first in compilation order wins.
        assert_eq!(db.scan(b"/video/x"), Some(7));
        assert_eq!(db.scan(b"/vote"), Some(9));
        assert_eq!(db.scan(b"/audio"), None);
    }

    #[test]
    fn dotall_matches_across_newlines() {
        let db = AdfDb::compile(&[(1, "a.b".into())]).unwrap();
        assert_eq!(db.scan(b"a\nb"), Some(1));
    }

    #[test]
    fn compile_error_carries_diagnostic() {
        let err = AdfDb::compile(&[(1, "(".into())]).unwrap_err();
        match err {
            Error::Compile(diag) => assert!(!diag.is_empty()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn empty_pattern_set_is_rejected() {
        assert!(matches!(AdfDb::compile(&[]), Err(Error::NotFound)));
    }

    #[test]
    fn patterns_dump_preserves_order() {
        let db = AdfDb::compile(&[(3, "x".into()), (4, "y".into())]).unwrap();
        assert_eq!(
            db.patterns(),
            vec![(3, "x".to_string()), (4, "y".to_string())]
        );
    }
}
