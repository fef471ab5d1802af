use crate::language::Language;

/// Code-editing surface the controller drives
pub trait EditorSurface {
    fn text(&self) -> String;
    fn set_text(&mut self, text: &str);
    fn is_editable(&self) -> bool;
    fn set_editable(&mut self, editable: bool);
    /// Shown instead of the content while the surface is empty
    fn set_placeholder(&mut self, placeholder: Option<&str>);
    /// Syntax mode for the bound backend
    fn set_language(&mut self, language: Language);
}

/// Line-based text buffer with a cursor; the terminal editor.
///
/// Editing methods return whether the content changed so the caller can
/// forward a change notification. They are no-ops while read-only.
#[derive(Debug, Clone)]
pub struct TextBuffer {
    lines: Vec<String>,
    row: usize,
    col: usize,
    editable: bool,
    placeholder: Option<String>,
    language: Language,
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self {
            lines: vec![String::new()],
            row: 0,
            col: 0,
            editable: false,
            placeholder: None,
            language: Language::default(),
        }
    }
}

const INDENT: &str = "    ";

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Cursor as (row, char column)
    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn placeholder(&self) -> Option<&str> {
        self.placeholder.as_deref()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 1 && self.lines[0].is_empty()
    }

    pub fn insert_char(&mut self, c: char) -> bool {
        if !self.editable {
            return false;
        }
        let at = self.byte_index();
        self.lines[self.row].insert(at, c);
        self.col += 1;
        true
    }

    pub fn insert_tab(&mut self) -> bool {
        if !self.editable {
            return false;
        }
        INDENT.chars().for_each(|c| {
            self.insert_char(c);
        });
        true
    }

    pub fn insert_newline(&mut self) -> bool {
        if !self.editable {
            return false;
        }
        let at = self.byte_index();
        let rest = self.lines[self.row].split_off(at);
        let indent: String = self.lines[self.row]
            .chars()
            .take_while(|c| *c == ' ')
            .collect();
        self.row += 1;
        self.col = indent.chars().count();
        self.lines.insert(self.row, indent + &rest);
        true
    }

    pub fn backspace(&mut self) -> bool {
        if !self.editable {
            return false;
        }
        if self.col > 0 {
            self.col -= 1;
            let at = self.byte_index();
            self.lines[self.row].remove(at);
            true
        } else if self.row > 0 {
            let line = self.lines.remove(self.row);
            self.row -= 1;
            self.col = self.line_len(self.row);
            self.lines[self.row].push_str(&line);
            true
        } else {
            false
        }
    }

    pub fn delete(&mut self) -> bool {
        if !self.editable {
            return false;
        }
        if self.col < self.line_len(self.row) {
            let at = self.byte_index();
            self.lines[self.row].remove(at);
            true
        } else if self.row + 1 < self.lines.len() {
            let next = self.lines.remove(self.row + 1);
            self.lines[self.row].push_str(&next);
            true
        } else {
            false
        }
    }

    pub fn move_left(&mut self) {
        if self.col > 0 {
            self.col -= 1;
        } else if self.row > 0 {
            self.row -= 1;
            self.col = self.line_len(self.row);
        }
    }

    pub fn move_right(&mut self) {
        if self.col < self.line_len(self.row) {
            self.col += 1;
        } else if self.row + 1 < self.lines.len() {
            self.row += 1;
            self.col = 0;
        }
    }

    pub fn move_up(&mut self) {
        if self.row > 0 {
            self.row -= 1;
            self.col = self.col.min(self.line_len(self.row));
        }
    }

    pub fn move_down(&mut self) {
        if self.row + 1 < self.lines.len() {
            self.row += 1;
            self.col = self.col.min(self.line_len(self.row));
        }
    }

    pub fn move_home(&mut self) {
        self.col = 0;
    }

    pub fn move_end(&mut self) {
        self.col = self.line_len(self.row);
    }

    fn line_len(&self, row: usize) -> usize {
        self.lines[row].chars().count()
    }

    fn byte_index(&self) -> usize {
        let line = &self.lines[self.row];
        line.char_indices()
            .nth(self.col)
            .map(|(i, _)| i)
            .unwrap_or(line.len())
    }
}

impl EditorSurface for TextBuffer {
    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn set_text(&mut self, text: &str) {
        self.lines = text.split('\n').map(str::to_string).collect();
        self.row = 0;
        self.col = 0;
    }

    fn is_editable(&self) -> bool {
        self.editable
    }

    fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    fn set_placeholder(&mut self, placeholder: Option<&str>) {
        self.placeholder = placeholder.map(str::to_string);
    }

    fn set_language(&mut self, language: Language) {
        self.language = language;
    }
}
