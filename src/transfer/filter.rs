use crate::config::DownloadFilter;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

/// Compiled download exclusion list.
///
/// Raw entries are regular expressions searched anywhere in the virtual path.
/// Escaped entries are globs (`*` is the only wildcard) that must match the
/// whole file name. Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct DownloadFilterEngine {
    matcher: Option<Regex>,
    failed: Vec<(String, String)>,
}

impl DownloadFilterEngine {
    /// Compile `filters`. Invalid entries are skipped and reported through
    /// [`DownloadFilterEngine::failed`]; if the composite expression cannot be
    /// built, nothing is filtered.
    pub fn compile(filters: &[DownloadFilter]) -> Self {
        let mut sorted: Vec<&DownloadFilter> = filters.iter().collect();
        sorted.sort_by(|a, b| (&a.pattern, a.escaped).cmp(&(&b.pattern, b.escaped)));

        let mut alternatives = Vec::new();
        let mut failed = Vec::new();

        for filter in sorted {
            if filter.pattern.is_empty() {
                continue;
            }

            let expression = if filter.escaped {
                let glob = regex::escape(&filter.pattern).replace("\\*", ".*");
                format!(r"(?:^|[\\/])(?:{})$", glob)
            } else {
                filter.pattern.clone()
            };

            match Regex::new(&expression) {
                Ok(_) => alternatives.push(format!("(?:{})", expression)),
                Err(e) => failed.push((filter.pattern.clone(), e.to_string())),
            }
        }

        if !failed.is_empty() {
            let errors: Vec<String> = failed
                .iter()
                .map(|(pattern, error)| format!("Filter: {} Error: {}", pattern, error))
                .collect();
            warn!("{} download filters failed! {}", failed.len(), errors.join(" "));
        }

        if alternatives.is_empty() {
            return Self {
                matcher: None,
                failed,
            };
        }

        let matcher = match RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .build()
        {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                warn!("Download filter failed, verify your filters: {}", e);
                None
            }
        };

        Self { matcher, failed }
    }

    /// An engine that lets everything through.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.matcher.is_some()
    }

    pub fn failed(&self) -> &[(String, String)] {
        &self.failed
    }

    pub fn is_filtered(&self, virtual_path: &str) -> bool {
        let Some(ref matcher) = self.matcher else {
            return false;
        };

        let filtered = matcher.is_match(virtual_path);
        if filtered {
            debug!("Filtering: {}", virtual_path);
        }
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_expression() {
        let engine = DownloadFilterEngine::compile(&[DownloadFilter::new("\\.exe$", false)]);

        assert!(engine.is_filtered("song.exe"));
        assert!(engine.is_filtered("Music\\SONG.EXE"));
        assert!(!engine.is_filtered("song.mp3"));
    }

    #[test]
    fn test_escaped_globs_match_whole_name() {
        let engine = DownloadFilterEngine::compile(&[
            DownloadFilter::new("desktop.ini", true),
            DownloadFilter::new("*.url", true),
        ]);

        assert!(engine.is_filtered("share\\album\\Desktop.ini"));
        assert!(engine.is_filtered("share\\album\\link.url"));
        assert!(!engine.is_filtered("share\\album\\notdesktop.ini"));
        assert!(!engine.is_filtered("share\\album\\desktopxini"));
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let engine = DownloadFilterEngine::compile(&[
            DownloadFilter::new("(unclosed", false),
            DownloadFilter::new("\\.tmp$", false),
        ]);

        assert_eq!(engine.failed().len(), 1);
        assert!(engine.is_filtered("file.tmp"));
        assert!(!engine.is_filtered("file.mp3"));
    }

    #[test]
    fn test_no_filters_lets_everything_through() {
        let engine = DownloadFilterEngine::compile(&[]);
        assert!(!engine.is_active());
        assert!(!engine.is_filtered("anything.exe"));
        assert!(!DownloadFilterEngine::disabled().is_filtered("x"));
    }
}
