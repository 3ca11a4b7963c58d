// 🧑‍⚖️ Interactive Resolver - operator fixes keys that still fail to match
//
// Two layers:
// - KeyResolution: pure state machine for one broken key, fed line by line
// - InteractiveResolver: terminal adapter (LineSource in, Write out) that
//   writes each accepted correction through the store before moving on
//
// States: Unresolved -> {Suggested, Searching} -> {Accepted, Skipped}

use crate::corrections::{CorrectionMap, CorrectionStore};
use crate::error::Result;
use crate::keys::CanonicalKey;
use crate::suggest::{CandidateSuggester, Suggestion};
use std::collections::{BTreeSet, VecDeque};
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOrigin {
    /// Already present in the correction map, no prompt shown
    Known,
    Suggestion,
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrigin {
    /// Fuzzy candidates computed before the operator typed anything
    Ranked,
    /// Substring hits for the operator's term
    Search,
    /// Fuzzy fallback when the term had no substring hit
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub origin: ListingOrigin,
    pub term: Option<String>,
    pub candidates: Vec<CanonicalKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionState {
    Unresolved,
    Suggested { candidate: CanonicalKey },
    /// `listing` is None while waiting for a search term
    Searching { listing: Option<Listing> },
    Accepted { key: CanonicalKey, origin: AcceptOrigin },
    Skipped,
}

/// What the operator is being asked right now
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt<'a> {
    Confirm { broken: &'a CanonicalKey, candidate: &'a CanonicalKey },
    SearchTerm { broken: &'a CanonicalKey },
    Choose { broken: &'a CanonicalKey, listing: &'a Listing },
}

/// Feedback for input that did not move the state forward
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    MalformedKey,
    UnrecognizedAnswer(String),
    NoResults(String),
    InvalidChoice { max: usize },
    UnknownReferenceKey(CanonicalKey),
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::MalformedKey => {
                "Key does not have the PROJECT|ACTION|UNIT|YEAR shape; search manually.".to_string()
            }
            Notice::UnrecognizedAnswer(answer) => {
                format!("Unrecognized answer '{}'. Type s, p or press Enter.", answer)
            }
            Notice::NoResults(term) => format!("No results for '{}'.", term),
            Notice::InvalidChoice { max } => {
                format!("Invalid choice. Type a number between 1 and {}, or 0 to search again.", max)
            }
            Notice::UnknownReferenceKey(key) => {
                format!("'{}' is not a cost-center key; choose another.", key)
            }
        }
    }
}

pub struct KeyResolution<'a> {
    broken: CanonicalKey,
    suggester: &'a CandidateSuggester,
    state: ResolutionState,
}

impl<'a> KeyResolution<'a> {
    pub fn new(broken: CanonicalKey, suggester: &'a CandidateSuggester) -> Self {
        KeyResolution {
            broken,
            suggester,
            state: ResolutionState::Unresolved,
        }
    }

    /// Leave `Unresolved`: known keys are accepted silently, everything else
    /// lands in Suggested or Searching
    pub fn start(&mut self, known: &CorrectionMap) -> Option<Notice> {
        if self.state != ResolutionState::Unresolved {
            return None;
        }

        if let Some(correct) = known.get(&self.broken) {
            self.state = ResolutionState::Accepted {
                key: correct.clone(),
                origin: AcceptOrigin::Known,
            };
            return None;
        }

        let parts = match self.broken.parts() {
            Ok(parts) => parts,
            Err(_) => {
                self.state = ResolutionState::Searching { listing: None };
                return Some(Notice::MalformedKey);
            }
        };

        self.state = match self.suggester.suggest(&parts) {
            Suggestion::Exact(candidate) if candidate != self.broken => {
                ResolutionState::Suggested { candidate }
            }
            Suggestion::Ranked(ranked) => {
                let mut candidates: Vec<CanonicalKey> = Vec::new();
                for candidate in ranked {
                    if !candidates.contains(&candidate.key) {
                        candidates.push(candidate.key);
                    }
                }
                ResolutionState::Searching {
                    listing: Some(Listing {
                        origin: ListingOrigin::Ranked,
                        term: None,
                        candidates,
                    }),
                }
            }
            _ => ResolutionState::Searching { listing: None },
        };
        None
    }

    pub fn broken(&self) -> &CanonicalKey {
        &self.broken
    }

    pub fn state(&self) -> &ResolutionState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ResolutionState::Accepted { .. } | ResolutionState::Skipped
        )
    }

    pub fn prompt(&self) -> Option<Prompt<'_>> {
        match &self.state {
            ResolutionState::Suggested { candidate } => Some(Prompt::Confirm {
                broken: &self.broken,
                candidate,
            }),
            ResolutionState::Searching { listing: None } => Some(Prompt::SearchTerm { broken: &self.broken }),
            ResolutionState::Searching { listing: Some(listing) } => Some(Prompt::Choose {
                broken: &self.broken,
                listing,
            }),
            _ => None,
        }
    }

    /// Abandon the key (end of input)
    pub fn skip(&mut self) {
        if !self.is_terminal() {
            self.state = ResolutionState::Skipped;
        }
    }

    /// Apply one line of operator input
    pub fn feed(&mut self, line: &str) -> Option<Notice> {
        let input = line.trim();

        let next = match &self.state {
            ResolutionState::Suggested { candidate } => match input.to_lowercase().as_str() {
                "s" => self.accept(candidate.clone(), AcceptOrigin::Suggestion),
                "p" => Ok(ResolutionState::Searching { listing: None }),
                "" => Ok(ResolutionState::Skipped),
                _ => Err(Notice::UnrecognizedAnswer(input.to_string())),
            },
            ResolutionState::Searching { listing: None } => {
                if input.is_empty() {
                    Ok(ResolutionState::Skipped)
                } else {
                    self.search(input)
                }
            }
            ResolutionState::Searching { listing: Some(listing) } => match input.parse::<usize>() {
                Ok(0) => Ok(ResolutionState::Searching { listing: None }),
                Ok(n) if n <= listing.candidates.len() => {
                    self.accept(listing.candidates[n - 1].clone(), AcceptOrigin::Search)
                }
                _ => Err(Notice::InvalidChoice {
                    max: listing.candidates.len(),
                }),
            },
            ResolutionState::Unresolved | ResolutionState::Accepted { .. } | ResolutionState::Skipped => {
                return None
            }
        };

        match next {
            Ok(state) => {
                self.state = state;
                None
            }
            Err(notice) => Some(notice),
        }
    }

    fn accept(&self, key: CanonicalKey, origin: AcceptOrigin) -> std::result::Result<ResolutionState, Notice> {
        if !self.suggester.contains(&key) {
            return Err(Notice::UnknownReferenceKey(key));
        }
        Ok(ResolutionState::Accepted { key, origin })
    }

    fn search(&self, term: &str) -> std::result::Result<ResolutionState, Notice> {
        let (origin, candidates) = match self.suggester.search(term) {
            hits if !hits.is_empty() => (ListingOrigin::Search, hits),
            _ => (ListingOrigin::Fuzzy, self.suggester.fuzzy_search(term)),
        };

        if candidates.is_empty() {
            return Err(Notice::NoResults(term.to_string()));
        }

        Ok(ResolutionState::Searching {
            listing: Some(Listing {
                origin,
                term: Some(term.to_string()),
                candidates,
            }),
        })
    }
}

// ============================================================================
// LINE SOURCES
// ============================================================================

pub trait LineSource {
    /// Next line without its terminator; None at end of input
    fn next_line(&mut self) -> Result<Option<String>>;
}

/// Reads the operator's answers from standard input
pub struct StdinSource {
    stdin: io::Stdin,
}

impl StdinSource {
    pub fn new() -> Self {
        StdinSource { stdin: io::stdin() }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSource for StdinSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self.stdin.lock().read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Pre-recorded answers, for tests and non-interactive replays
#[derive(Debug, Default)]
pub struct ScriptedSource {
    lines: VecDeque<String>,
}

impl ScriptedSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedSource {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.lines.len()
    }
}

impl LineSource for ScriptedSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.pop_front())
    }
}

// ============================================================================
// TERMINAL ADAPTER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub total: usize,
    pub already_known: usize,
    pub accepted: usize,
    pub skipped: usize,
    /// Input ended before every key was visited
    pub interrupted: bool,
}

pub struct InteractiveResolver<'a, S: CorrectionStore + ?Sized> {
    store: &'a S,
    suggester: &'a CandidateSuggester,
}

impl<'a, S: CorrectionStore + ?Sized> InteractiveResolver<'a, S> {
    pub fn new(store: &'a S, suggester: &'a CandidateSuggester) -> Self {
        InteractiveResolver { store, suggester }
    }

    /// Walk every broken key in sorted order. Returns early (Err) only when
    /// the store rejects a write; accepts made before that stay persisted.
    pub fn run(
        &self,
        broken_keys: &BTreeSet<CanonicalKey>,
        input: &mut dyn LineSource,
        out: &mut dyn Write,
    ) -> Result<SessionSummary> {
        let mut known = self.store.load_or_empty()?;
        let mut summary = SessionSummary {
            total: broken_keys.len(),
            ..SessionSummary::default()
        };

        info!("Starting interactive correction of {} keys", broken_keys.len());

        for (index, broken) in broken_keys.iter().enumerate() {
            if summary.interrupted {
                summary.skipped += 1;
                continue;
            }

            let mut resolution = KeyResolution::new(broken.clone(), self.suggester);
            let opening = resolution.start(&known);

            if let ResolutionState::Accepted { origin: AcceptOrigin::Known, .. } = resolution.state() {
                summary.already_known += 1;
                continue;
            }

            writeln!(out)?;
            writeln!(out, "[{}/{}] Unmatched key: {}", index + 1, broken_keys.len(), broken)?;
            if let Some(notice) = opening {
                writeln!(out, "  ! {}", notice.message())?;
            }

            while let Some(prompt) = resolution.prompt() {
                render_prompt(out, &prompt)?;
                out.flush()?;

                let line = match input.next_line()? {
                    Some(line) => line,
                    None => {
                        warn!("Input closed, stopping the correction session");
                        summary.interrupted = true;
                        resolution.skip();
                        break;
                    }
                };

                if let Some(notice) = resolution.feed(&line) {
                    writeln!(out, "  ! {}", notice.message())?;
                }
            }

            match resolution.state() {
                ResolutionState::Accepted { key, .. } => {
                    self.store.upsert(broken, key)?;
                    known.insert(broken.clone(), key.clone());
                    summary.accepted += 1;
                    writeln!(out, "  ✓ Saved: {} -> {}", broken, key)?;
                    info!("Correction saved: {} -> {}", broken, key);
                }
                _ => {
                    summary.skipped += 1;
                    writeln!(out, "  - Skipped")?;
                }
            }
        }

        info!(
            "Correction session finished: {} accepted, {} skipped, {} already known",
            summary.accepted, summary.skipped, summary.already_known
        );
        Ok(summary)
    }
}

fn render_prompt(out: &mut dyn Write, prompt: &Prompt<'_>) -> io::Result<()> {
    match prompt {
        Prompt::Confirm { candidate, .. } => {
            writeln!(out, "  Suggested: {}", candidate)?;
            write!(out, "  [s] accept  [p] search  [Enter] skip > ")
        }
        Prompt::SearchTerm { .. } => write!(out, "  Search project/action (Enter to skip) > "),
        Prompt::Choose { listing, .. } => {
            let heading = match (listing.origin, &listing.term) {
                (ListingOrigin::Ranked, _) => "Closest cost-center keys:".to_string(),
                (ListingOrigin::Search, Some(term)) => format!("Results for '{}':", term),
                (ListingOrigin::Fuzzy, Some(term)) => {
                    format!("No exact results for '{}'. Closest keys:", term)
                }
                (_, None) => "Results:".to_string(),
            };
            writeln!(out, "  {}", heading)?;
            for (i, key) in listing.candidates.iter().enumerate() {
                writeln!(out, "    {}. {}", i + 1, key)?;
            }
            write!(out, "  Choose 1-{} (0 to search again) > ", listing.candidates.len())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
