//! Source markup → target wiki markup.
//!
//! Content is rewritten line by line. The first line is reserved for the
//! provenance header the caller prepends and is never touched; blank lines
//! pass through unchanged. Constructs are applied in a fixed order and each
//! substitution locks its output, so a later pattern can never re-match
//! text an earlier one produced:
//!
//! | Step | Source | Target |
//! |------|--------|--------|
//! | 1 | ```` ```lang ````, `<pre><code>`, `<pre>` | `{code:lang}`, `{code}`, `{noformat}` |
//! | 2 | `[[url:URL\|TEXT]]`, `[[url:URL]]` | `[TEXT\|URL]`, `[URL]` |
//! | 3 | `` `code` ``, `<code>code</code>` | `{{code}}` |
//! | 4 | `@login`, `[[user:login\|name]]` | `[~accountid:ID]` |
//! | 5 | `[[image:ID\|text]]` | `!filename\|thumbnail!` |
//! | 6 | `#123` | `[KEY-7\|browse url]` (optionally struck through) |
//!
//! Lines inside a code block are copied verbatim.
//!
//! Unresolved mentions, images and ticket numbers produce a [`Warning`]
//! and a fallback rendering that is memoized in the [`RunContext`], so the
//! same token renders identically every time it recurs. Lookups always
//! consult the [`IdentifierMap`] first: a ticket migrated after an earlier
//! miss resolves on the next run.

use std::collections::HashMap;

use regex::Regex;

use crate::context::RunContext;
use crate::idmap::{IdentifierMap, MapKind};
use crate::models::{Warning, WarningKind};
use crate::segment::{self, Segment};
use crate::xref::{LinkTemplates, RepoTable};

/// Field limit of the target tracker for descriptions and comment bodies.
pub const MAX_CONTENT_LEN: usize = 32_767;

/// Characters kept back from the limit before the ellipsis is appended.
const TRUNCATE_MARGIN: usize = 6;

/// How resolved user mentions are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionStyle {
    /// `[~accountid:ID]` (cloud).
    AccountId,
    /// `[~username]` (server / data center).
    UserName,
}

#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions {
    pub preserve_first_line: bool,
    /// Render resolved ticket links struck through.
    pub strikethrough: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            preserve_first_line: true,
            strikethrough: false,
        }
    }
}

/// Result of rewriting one content field.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    pub text: String,
    /// Distinct warnings in order of first occurrence.
    pub warnings: Vec<Warning>,
    pub truncated: bool,
}

impl Rewritten {
    /// The text below the header line and the blank line that follows it.
    pub fn body(&self) -> &str {
        strip_header(&self.text)
    }
}

/// Text after the first line and at most one following blank line.
pub fn strip_header(text: &str) -> &str {
    match text.split_once('\n') {
        Some((_, rest)) => rest.strip_prefix('\n').unwrap_or(rest),
        None => "",
    }
}

struct Patterns {
    block: Regex,
    url_text: Regex,
    url_bare: Regex,
    inline_tick: Regex,
    inline_tag: Regex,
    user_tag: Regex,
    mention: Regex,
    image: Regex,
    ticket: Regex,
}

impl Patterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            block: Regex::new(r"(?i)(<pre>\s*<code>|</code>\s*</pre>|<pre>|</pre>)")?,
            url_text: Regex::new(r"\[\[url:([^\]|]+)\|([^\]]+)\]\]")?,
            url_bare: Regex::new(r"\[\[url:([^\]|]+)\]\]")?,
            inline_tick: Regex::new(r"`([^`]+)`")?,
            inline_tag: Regex::new(r"(?i)<code>(.*?)</code>")?,
            user_tag: Regex::new(r"\[\[user:([^\]|]+)(?:\|([^\]]*))?\]\]")?,
            mention: Regex::new(r"(^|[^\w.@/])@([A-Za-z0-9_](?:[\w.\-]*\w)?)")?,
            image: Regex::new(r"\[\[image:([^\]|]+)(?:\|([^\]]*))?\]\]")?,
            ticket: Regex::new(r"(^|[^\w/&#=?:\-\[])#(\d+)\b")?,
        })
    }
}

/// Rewrites source markup into target markup.
pub struct ContentRewriter {
    links: LinkTemplates,
    mentions: MentionStyle,
    attachments: HashMap<String, String>,
    patterns: Patterns,
}

impl ContentRewriter {
    pub fn new(links: LinkTemplates, mentions: MentionStyle) -> Result<Self, regex::Error> {
        Ok(Self {
            links,
            mentions,
            attachments: HashMap::new(),
            patterns: Patterns::new()?,
        })
    }

    /// Attachment id → file name lookup used for inline images.
    pub fn with_attachments(mut self, attachments: HashMap<String, String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn links(&self) -> &LinkTemplates {
        &self.links
    }

    /// Render a resolved user reference.
    pub fn user_ref(&self, target: &str) -> String {
        match self.mentions {
            MentionStyle::AccountId => format!("[~accountid:{}]", target),
            MentionStyle::UserName => format!("[~{}]", target),
        }
    }

    /// Rewrite `text` and truncate the result to [`MAX_CONTENT_LEN`].
    pub fn rewrite(
        &self,
        text: &str,
        ids: &IdentifierMap,
        ctx: &mut RunContext,
        opts: RewriteOptions,
    ) -> Rewritten {
        let mut warnings: Vec<Warning> = Vec::new();
        let mut out: Vec<String> = Vec::new();
        let mut in_code = false;

        for (i, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if (i == 0 && opts.preserve_first_line) || line.trim().is_empty() {
                out.push(line.to_string());
                continue;
            }
            if let Some(fence) = self.fence(line, &mut in_code) {
                out.push(fence);
                continue;
            }
            if in_code {
                out.push(line.to_string());
                continue;
            }
            out.push(self.rewrite_line(line, ids, ctx, opts, &mut warnings));
        }

        let (text, truncated) = truncate_content(&out.join("\n"), MAX_CONTENT_LEN);
        Rewritten {
            text,
            warnings,
            truncated,
        }
    }

    /// Convert code block delimiters on `line`, tracking whether a block is
    /// open. Returns `None` when the line has no delimiter.
    fn fence(&self, line: &str, in_code: &mut bool) -> Option<String> {
        let trimmed = line.trim();
        if let Some(lang) = trimmed.strip_prefix("```") {
            let lang = lang.trim();
            let out = if *in_code || lang.is_empty() {
                "{code}".to_string()
            } else {
                format!("{{code:{}}}", lang)
            };
            *in_code = !*in_code;
            return Some(out);
        }
        if !self.patterns.block.is_match(line) {
            return None;
        }
        let converted = self
            .patterns
            .block
            .replace_all(line, |caps: &regex::Captures| {
                let tag = caps[1].to_ascii_lowercase();
                *in_code = !tag.starts_with("</");
                if tag.contains("code") {
                    "{code}".to_string()
                } else {
                    "{noformat}".to_string()
                }
            });
        Some(converted.into_owned())
    }

    fn rewrite_line(
        &self,
        line: &str,
        ids: &IdentifierMap,
        ctx: &mut RunContext,
        opts: RewriteOptions,
        warnings: &mut Vec<Warning>,
    ) -> String {
        let p = &self.patterns;

        let segs = segment::open(line);
        let segs = segment::substitute(segs, &p.url_text, |c| format!("[{}|{}]", &c[2], &c[1]));
        let segs = segment::substitute(segs, &p.url_bare, |c| format!("[{}]", &c[1]));
        let segs = segment::substitute(segs, &p.inline_tick, |c| format!("{{{{{}}}}}", &c[1]));
        let segs = segment::substitute(segs, &p.inline_tag, |c| format!("{{{{{}}}}}", &c[1]));

        let segs = segment::substitute(segs, &p.user_tag, |c| {
            let (text, w) = self.mention(c[1].trim(), ids, ctx);
            if let Some(w) = w {
                push_unique(warnings, w);
            }
            text
        });
        let segs = segment::substitute(segs, &p.mention, |c| {
            let (text, w) = self.mention(&c[2], ids, ctx);
            if let Some(w) = w {
                push_unique(warnings, w);
            }
            format!("{}{}", &c[1], text)
        });

        let segs = segment::substitute(segs, &p.image, |c| {
            let (text, w) = self.image(c[1].trim(), &c[0], ctx);
            if let Some(w) = w {
                push_unique(warnings, w);
            }
            text
        });

        let segs: Vec<Segment> = segment::substitute(segs, &p.ticket, |c| {
            let (text, w) = self.ticket(&c[2], ids, ctx, opts.strikethrough);
            if let Some(w) = w {
                push_unique(warnings, w);
            }
            format!("{}{}", &c[1], text)
        });

        segment::join(&segs)
    }

    fn mention(
        &self,
        login: &str,
        ids: &IdentifierMap,
        ctx: &mut RunContext,
    ) -> (String, Option<Warning>) {
        if let Some(target) = ids.get(MapKind::UserLogin, login) {
            return (self.user_ref(target), None);
        }
        let (text, w) = ctx.memoize(WarningKind::UnknownUser, login, format!("[{}]", login));
        (text, Some(w))
    }

    fn image(&self, id: &str, original: &str, ctx: &mut RunContext) -> (String, Option<Warning>) {
        if let Some(filename) = self.attachments.get(id) {
            return (format!("!{}|thumbnail!", filename), None);
        }
        let (text, w) = ctx.memoize(WarningKind::UnknownImage, id, original.to_string());
        (text, Some(w))
    }

    fn ticket(
        &self,
        number: &str,
        ids: &IdentifierMap,
        ctx: &mut RunContext,
        strikethrough: bool,
    ) -> (String, Option<Warning>) {
        if let Some(key) = ids.get(MapKind::TicketNumber, number) {
            let link = format!("[{}|{}]", key, self.links.issue_url(key));
            let link = if strikethrough {
                format!("-{}-", link)
            } else {
                link
            };
            return (link, None);
        }
        let token = format!("#{}", number);
        let (text, w) = ctx.memoize(WarningKind::UnknownTicket, &token, token.clone());
        (text, Some(w))
    }
}

fn push_unique(warnings: &mut Vec<Warning>, w: Warning) {
    if !warnings.contains(&w) {
        warnings.push(w);
    }
}

/// Truncate `text` to at most `max` characters, keeping `max - 6`
/// characters and appending `...`.
pub fn truncate_content(text: &str, max: usize) -> (String, bool) {
    if text.chars().count() <= max {
        return (text.to_string(), false);
    }
    let keep = max.saturating_sub(TRUNCATE_MARGIN);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    (out, true)
}

/// Expand source commit references into a target repository link.
///
/// `Commit: [[r:18:abc123|reponame:xyz]]` becomes the original line
/// prefixed with `Assembla ` followed by `Commit: [abc123|URL]`, where URL
/// is the repository template with `[[REPO-NAME]]` replaced by the
/// translated repository name and `/abc123` appended. An unknown repository
/// appends an `ERROR:` line instead.
pub struct CommitExpander {
    re: Regex,
}

impl CommitExpander {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            re: Regex::new(r"Commit: \[\[(?:.*):([0-9a-f]+)\|(.*):(?:.*)\]\]")?,
        })
    }

    pub fn is_commit(&self, body: &str) -> bool {
        self.re.is_match(body)
    }

    pub fn expand(&self, body: &str, repos: &RepoTable, url_template: &str) -> (String, Vec<Warning>) {
        let mut warnings = Vec::new();
        let out = self.re.replace_all(body, |c: &regex::Captures| {
            let hash = &c[1];
            let from = &c[2];
            match repos.get(from) {
                Some(to) => format!(
                    "Assembla {}\nCommit: [{}|{}]",
                    &c[0],
                    hash,
                    repos.commit_url(url_template, to, hash)
                ),
                None => {
                    push_unique(&mut warnings, Warning::new(WarningKind::MissingRepository, from));
                    format!("{}\nERROR: Cannot find repo entry for '{}'", &c[0], from)
                }
            }
        });
        (out.into_owned(), warnings)
    }
}
