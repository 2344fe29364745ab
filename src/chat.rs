//! Chat-message builder: the JSON structure used for status descriptions and
//! disconnect/kick reasons.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    DarkBlue,
    DarkGreen,
    DarkAqua,
    DarkRed,
    DarkPurple,
    Gold,
    Gray,
    DarkGray,
    Blue,
    Green,
    Aqua,
    Red,
    LightPurple,
    Yellow,
    White,
    Reset,
}

impl Color {
    pub fn as_str(self) -> &'static str {
        match self {
            Color::Black => "black",
            Color::DarkBlue => "dark_blue",
            Color::DarkGreen => "dark_green",
            Color::DarkAqua => "dark_aqua",
            Color::DarkRed => "dark_red",
            Color::DarkPurple => "dark_purple",
            Color::Gold => "gold",
            Color::Gray => "gray",
            Color::DarkGray => "dark_gray",
            Color::Blue => "blue",
            Color::Green => "green",
            Color::Aqua => "aqua",
            Color::Red => "red",
            Color::LightPurple => "light_purple",
            Color::Yellow => "yellow",
            Color::White => "white",
            Color::Reset => "reset",
        }
    }

    pub fn from_name(name: &str) -> Option<Color> {
        Some(match name.to_ascii_lowercase().as_str() {
            "black" => Color::Black,
            "dark_blue" => Color::DarkBlue,
            "dark_green" => Color::DarkGreen,
            "dark_aqua" => Color::DarkAqua,
            "dark_red" => Color::DarkRed,
            "dark_purple" => Color::DarkPurple,
            "gold" => Color::Gold,
            "gray" => Color::Gray,
            "dark_gray" => Color::DarkGray,
            "blue" => Color::Blue,
            "green" => Color::Green,
            "aqua" => Color::Aqua,
            "red" => Color::Red,
            "light_purple" => Color::LightPurple,
            "yellow" => Color::Yellow,
            "white" => Color::White,
            "reset" => Color::Reset,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub action: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoverEvent {
    pub action: String,
    pub value: String,
}

/// A chat-message node. `extra` is a finite, caller-owned tree; this crate
/// builds and consumes messages linearly, so no cycle-detection is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underlined: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strikethrough: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(rename = "clickEvent", skip_serializing_if = "Option::is_none")]
    pub click_event: Option<ClickEvent>,
    #[serde(rename = "hoverEvent", skip_serializing_if = "Option::is_none")]
    pub hover_event: Option<HoverEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Vec<ChatMessage>>,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        ChatMessage {
            text: text.into(),
            bold: None,
            italic: None,
            underlined: None,
            strikethrough: None,
            color: None,
            click_event: None,
            hover_event: None,
            extra: None,
        }
    }

    pub fn set_bold(&mut self, bold: bool) -> &mut Self {
        self.bold = Some(bold);
        self
    }

    pub fn set_italic(&mut self, italic: bool) -> &mut Self {
        self.italic = Some(italic);
        self
    }

    pub fn set_underlined(&mut self, underlined: bool) -> &mut Self {
        self.underlined = Some(underlined);
        self
    }

    pub fn set_strikethrough(&mut self, strikethrough: bool) -> &mut Self {
        self.strikethrough = Some(strikethrough);
        self
    }

    /// Unknown color names fall back to `white` and log a warning.
    pub fn set_color(&mut self, name: &str) -> &mut Self {
        let color = Color::from_name(name).unwrap_or_else(|| {
            log::warn!("unknown chat color {name:?}, falling back to white");
            Color::White
        });
        self.color = Some(color.as_str().to_owned());
        self
    }

    pub fn hover_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.hover_event = Some(HoverEvent {
            action: "show_text".to_owned(),
            value: text.into(),
        });
        self
    }

    pub fn click_target(&mut self, url: impl Into<String>) -> &mut Self {
        self.click_event = Some(ClickEvent {
            action: "open_url".to_owned(),
            value: url.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_optional_fields_are_omitted() {
        let msg = ChatMessage::new("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"text":"hi"}"#);
    }

    #[test]
    fn builder_sets_expected_fields() {
        let mut msg = ChatMessage::new("kicked");
        msg.set_color("red").set_bold(true).hover_text("why");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""color":"red""#));
        assert!(json.contains(r#""bold":true"#));
        assert!(json.contains(r#""hoverEvent""#));
    }

    #[test]
    fn unknown_color_falls_back_to_white() {
        let mut msg = ChatMessage::new("x");
        msg.set_color("not_a_real_color");
        assert_eq!(msg.color.as_deref(), Some("white"));
    }
}
