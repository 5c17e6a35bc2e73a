use std::fmt;

use crate::state::{CommSite, LocaleID, State, TagInstance, TagRef, TaskID, TaskRecord};

/// Tags a backend walks: the reserved pair, then either the physical tags or
/// (when asked for and names repeat) the logical ones.
pub fn tag_views(state: &State, logical: bool) -> Vec<(TagRef, &TagInstance)> {
    let mut result = Vec::with_capacity(state.tag_count() + 2);
    for tag in [TagRef::All, TagRef::Start] {
        if let Some(instance) = state.get_tag_data(tag) {
            result.push((tag, instance));
        }
    }
    if logical && !state.has_unique_tags() {
        result.extend(state.tags.iter_logical());
    } else {
        result.extend(state.tags.iter());
    }
    result
}

/// File-system safe name for a tag's output.
pub fn slot_name(tag: TagRef) -> String {
    match tag {
        TagRef::All => "all".to_owned(),
        TagRef::Start => "start".to_owned(),
        TagRef::Tag(tag_id) => format!("tag{}", tag_id.0),
    }
}

pub struct SiteName<'a> {
    state: &'a State,
    site: CommSite,
}

impl<'a> SiteName<'a> {
    pub fn new(state: &'a State, site: CommSite) -> Self {
        SiteName { state, site }
    }
}

impl fmt::Display for SiteName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.site {
            CommSite::Line { file, line } => match self.state.file_name(file) {
                Some(name) => write!(f, "{}:{}", name, line),
                None => write!(f, "file {}:{}", file, line),
            },
            CommSite::Func(func) => match self.state.function(func) {
                Some(func) => write!(f, "{}", func.name),
                None => write!(f, "function {}", func),
            },
        }
    }
}

/// `task <id>`, with the creation site when the trace recorded one.
pub fn task_name(state: &State, locale: LocaleID, task: TaskID, record: &TaskRecord) -> String {
    match record.create {
        Some(create) => format!(
            "task {} on locale {} ({:?} at {})",
            task,
            locale,
            create.kind,
            SiteName::new(
                state,
                CommSite::Line {
                    file: create.file,
                    line: create.line
                }
            )
        ),
        None => format!("task {} on locale {}", task, locale),
    }
}
