//! Fixed-size character terminal attached to every computer.
//!
//! The scheduling core only needs a small slice of terminal behaviour: reset
//! on power transitions and writing failure messages. Rendering is the host's
//! concern.

use serde::Serialize;

/// Palette colours, numbered by their index in the terminal palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Colour {
    White = 0,
    Orange = 1,
    Magenta = 2,
    LightBlue = 3,
    Yellow = 4,
    Lime = 5,
    Pink = 6,
    Grey = 7,
    LightGrey = 8,
    Cyan = 9,
    Purple = 10,
    Blue = 11,
    Brown = 12,
    Green = 13,
    Red = 14,
    Black = 15,
}

impl Colour {
    pub fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Terminal {
    width: usize,
    height: usize,
    colour: bool,
    cursor_x: i32,
    cursor_y: i32,
    cursor_blink: bool,
    text_colour: Colour,
    background_colour: Colour,
    lines: Vec<Vec<char>>,
    text_colours: Vec<Vec<Colour>>,
}

impl Terminal {
    pub fn new(width: usize, height: usize, colour: bool) -> Self {
        Self {
            width,
            height,
            colour,
            cursor_x: 0,
            cursor_y: 0,
            cursor_blink: false,
            text_colour: Colour::White,
            background_colour: Colour::Black,
            lines: vec![vec![' '; width]; height],
            text_colours: vec![vec![Colour::White; width]; height],
        }
    }

    /// Clear the screen and restore cursor and colours to their initial state.
    pub fn reset(&mut self) {
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.cursor_blink = false;
        self.text_colour = Colour::White;
        self.background_colour = Colour::Black;
        for line in &mut self.lines {
            line.fill(' ');
        }
        for colours in &mut self.text_colours {
            colours.fill(Colour::White);
        }
    }

    /// Write text at the cursor, clipped to the screen, advancing the cursor.
    pub fn write(&mut self, text: &str) {
        let y = self.cursor_y;
        if y >= 0 && (y as usize) < self.height {
            let row = y as usize;
            for (offset, ch) in text.chars().enumerate() {
                let x = self.cursor_x + offset as i32;
                if x < 0 {
                    continue;
                }
                let x = x as usize;
                if x >= self.width {
                    break;
                }
                self.lines[row][x] = ch;
                self.text_colours[row][x] = self.text_colour;
            }
        }
        self.cursor_x += text.chars().count() as i32;
    }

    pub fn set_cursor_pos(&mut self, x: i32, y: i32) {
        self.cursor_x = x;
        self.cursor_y = y;
    }

    pub fn set_cursor_blink(&mut self, blink: bool) {
        self.cursor_blink = blink;
    }

    pub fn set_text_colour(&mut self, colour: Colour) {
        self.text_colour = colour;
    }

    pub fn set_background_colour(&mut self, colour: Colour) {
        self.background_colour = colour;
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_colour(&self) -> bool {
        self.colour
    }

    pub fn cursor_x(&self) -> i32 {
        self.cursor_x
    }

    pub fn cursor_y(&self) -> i32 {
        self.cursor_y
    }

    pub fn cursor_blink(&self) -> bool {
        self.cursor_blink
    }

    pub fn text_colour(&self) -> Colour {
        self.text_colour
    }

    /// Whether a blinking cursor is currently visible on screen.
    pub fn cursor_visible(&self) -> bool {
        self.cursor_blink
            && self.cursor_x >= 0
            && (self.cursor_x as usize) < self.width
            && self.cursor_y >= 0
            && (self.cursor_y as usize) < self.height
    }

    /// Contents of one row, trailing padding included.
    pub fn line(&self, y: usize) -> String {
        self.lines.get(y).map(|l| l.iter().collect()).unwrap_or_default()
    }

    /// Colour of the character at `(x, y)`.
    pub fn colour_at(&self, x: usize, y: usize) -> Option<Colour> {
        self.text_colours.get(y).and_then(|row| row.get(x)).copied()
    }

    /// All rows with trailing spaces trimmed.
    pub fn visible_text(&self) -> Vec<String> {
        (0..self.height)
            .map(|y| self.line(y).trim_end().to_string())
            .collect()
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new(51, 19, true)
    }
}
