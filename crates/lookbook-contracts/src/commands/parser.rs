use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, SINGLE_PATH_COMMANDS, STROKE_COMMANDS, TEXT_ARG_COMMANDS,
};

const DEFAULT_BRUSH_RADIUS: f64 = 24.0;

#[derive(Debug, Clone, PartialEq)]
pub struct EditorCommand {
    pub action: String,
    pub raw: String,
    pub instruction: Option<String>,
    pub args: BTreeMap<String, Value>,
}

impl EditorCommand {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            instruction: None,
            args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, usage: &str) -> Self {
        let mut command = Self::new("invalid", raw);
        command
            .args
            .insert("usage".to_string(), Value::String(usage.to_string()));
        command
    }

    fn with_instruction(mut self, text: &str) -> Self {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.instruction = Some(trimmed.to_string());
        }
        self
    }

    pub fn arg_f64(&self, key: &str) -> Option<f64> {
        self.args.get(key).and_then(Value::as_f64)
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// `x,y` pairs followed by an optional `r=<radius>`.
fn parse_stroke_args(arg: &str) -> Option<(Vec<Value>, f64)> {
    let mut points = Vec::new();
    let mut radius = DEFAULT_BRUSH_RADIUS;
    for token in arg.split_whitespace() {
        if let Some(raw) = token
            .strip_prefix("r=")
            .or_else(|| token.strip_prefix("radius="))
        {
            radius = parse_number(raw).filter(|value| *value > 0.0)?;
            continue;
        }
        let (x, y) = token.split_once(',')?;
        points.push(json!([parse_number(x)?, parse_number(y)?]));
    }
    if points.is_empty() {
        return None;
    }
    Some((points, radius))
}

fn parse_point(raw: &str, arg: &str) -> EditorCommand {
    let usage = "/point <x> <y> <instruction>";
    let mut parts = arg.splitn(3, char::is_whitespace);
    let (Some(x), Some(y)) = (
        parts.next().and_then(parse_number),
        parts.next().and_then(parse_number),
    ) else {
        return EditorCommand::invalid(raw, usage);
    };
    let instruction = parts.next().unwrap_or("").trim();
    if instruction.is_empty() {
        return EditorCommand::invalid(raw, usage);
    }
    let mut command = EditorCommand::new("point", raw).with_instruction(instruction);
    command.args.insert("x".to_string(), json!(x));
    command.args.insert("y".to_string(), json!(y));
    command
}

fn parse_mask(raw: &str, arg: &str) -> EditorCommand {
    let usage = "/mask <mask.png> <instruction>";
    let parts = split_args(arg);
    if parts.len() < 2 {
        return EditorCommand::invalid(raw, usage);
    }
    let mut command = EditorCommand::new("mask", raw).with_instruction(&parts[1..].join(" "));
    command
        .args
        .insert("path".to_string(), Value::String(parts[0].clone()));
    command
}

fn parse_crop(raw: &str, arg: &str) -> EditorCommand {
    let values: Vec<f64> = arg.split_whitespace().filter_map(parse_number).collect();
    if values.len() != 4 || values[2] <= 0.0 || values[3] <= 0.0 {
        return EditorCommand::invalid(raw, "/crop <x> <y> <w> <h>");
    }
    let mut command = EditorCommand::new("crop", raw);
    for (key, value) in ["x", "y", "width", "height"].into_iter().zip(values) {
        command.args.insert(key.to_string(), json!(value));
    }
    command
}

fn parse_resize(raw: &str, arg: &str) -> EditorCommand {
    let usage = "/resize <w>x<h>";
    let normalized = arg.trim().to_ascii_lowercase();
    let Some((w, h)) = normalized.split_once('x') else {
        return EditorCommand::invalid(raw, usage);
    };
    let (Ok(width), Ok(height)) = (w.trim().parse::<u32>(), h.trim().parse::<u32>()) else {
        return EditorCommand::invalid(raw, usage);
    };
    if width == 0 || height == 0 {
        return EditorCommand::invalid(raw, usage);
    }
    let mut command = EditorCommand::new("resize", raw);
    command.args.insert("width".to_string(), json!(width));
    command.args.insert("height".to_string(), json!(height));
    command
}

pub fn parse_command(text: &str) -> EditorCommand {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return EditorCommand::new("noop", text);
    }

    let Some(slash_tail) = raw_trimmed.strip_prefix('/') else {
        return EditorCommand::new("edit", text).with_instruction(raw_trimmed);
    };
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return EditorCommand::new("edit", text).with_instruction(raw_trimmed);
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    match command.as_str() {
        "point" => return parse_point(text, arg),
        "mask" => return parse_mask(text, arg),
        "crop" => return parse_crop(text, arg),
        "resize" => return parse_resize(text, arg),
        "expand" => {
            let mut parsed = EditorCommand::new("expand", text);
            let ratio = if arg.is_empty() { "1:1" } else { arg };
            parsed
                .args
                .insert("ratio".to_string(), Value::String(ratio.to_string()));
            return parsed;
        }
        _ => {}
    }

    if let Some(action) = find_action(&command, TEXT_ARG_COMMANDS) {
        if arg.is_empty() {
            return EditorCommand::invalid(text, &format!("/{command} <text>"));
        }
        return EditorCommand::new(action, text).with_instruction(arg);
    }

    if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
        let parts = split_args(arg);
        if parts.is_empty() {
            return EditorCommand::invalid(text, &format!("/{command} <path>"));
        }
        let mut parsed = EditorCommand::new(action, text);
        parsed
            .args
            .insert("path".to_string(), Value::String(parts.join(" ")));
        return parsed;
    }

    if let Some(action) = find_action(&command, STROKE_COMMANDS) {
        let Some((points, radius)) = parse_stroke_args(arg) else {
            return EditorCommand::invalid(text, &format!("/{command} <x,y> <x,y> ... [r=<radius>]"));
        };
        let mut parsed = EditorCommand::new(action, text);
        parsed
            .args
            .insert("points".to_string(), Value::Array(points));
        parsed.args.insert("radius".to_string(), json!(radius));
        return parsed;
    }

    if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
        return EditorCommand::new(action, text);
    }

    let mut unknown = EditorCommand::new("unknown", text);
    unknown
        .args
        .insert("command".to_string(), Value::String(command));
    unknown
        .args
        .insert("arg".to_string(), Value::String(arg.to_string()));
    unknown
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_command;

    #[test]
    fn point_with_instruction() {
        let command = parse_command("/point 120 340.5 remove the loose thread");
        assert_eq!(command.action, "point");
        assert_eq!(command.arg_f64("x"), Some(120.0));
        assert_eq!(command.arg_f64("y"), Some(340.5));
        assert_eq!(command.instruction.as_deref(), Some("remove the loose thread"));
    }

    #[test]
    fn point_without_instruction_is_invalid() {
        let command = parse_command("/point 1 2");
        assert_eq!(command.action, "invalid");
        assert_eq!(command.arg_str("usage"), Some("/point <x> <y> <instruction>"));
    }

    #[test]
    fn mask_accepts_quoted_path() {
        let command = parse_command("/mask \"/tmp/my mask.png\" make the collar navy");
        assert_eq!(command.action, "mask");
        assert_eq!(command.arg_str("path"), Some("/tmp/my mask.png"));
        assert_eq!(command.instruction.as_deref(), Some("make the collar navy"));
    }

    #[test]
    fn brush_points_and_radius() {
        let command = parse_command("/brush 10,10 40,12 r=8");
        assert_eq!(command.action, "brush");
        assert_eq!(command.args["points"], json!([[10.0, 10.0], [40.0, 12.0]]));
        assert_eq!(command.arg_f64("radius"), Some(8.0));

        assert_eq!(parse_command("/erase 5,5").arg_f64("radius"), Some(24.0));
        assert_eq!(parse_command("/brush nope").action, "invalid");
    }

    #[test]
    fn crop_resize_expand() {
        let crop = parse_command("/crop 0 10 200 300");
        assert_eq!(crop.action, "crop");
        assert_eq!(crop.arg_f64("height"), Some(300.0));
        assert_eq!(parse_command("/crop 0 10 0 300").action, "invalid");

        let resize = parse_command("/resize 1080X1350");
        assert_eq!(resize.args["width"], json!(1080));
        assert_eq!(parse_command("/resize big").action, "invalid");

        assert_eq!(parse_command("/expand 4:5").arg_str("ratio"), Some("4:5"));
        assert_eq!(parse_command("/expand").arg_str("ratio"), Some("1:1"));
    }

    #[test]
    fn plain_text_is_whole_image_edit() {
        let command = parse_command("  brighten the fabric  ");
        assert_eq!(command.action, "edit");
        assert_eq!(command.instruction.as_deref(), Some("brighten the fabric"));
        assert_eq!(parse_command("   ").action, "noop");
    }

    #[test]
    fn no_arg_path_and_unknown_commands() {
        assert_eq!(parse_command("/undo").action, "undo");
        assert_eq!(parse_command("/history").action, "history");
        assert_eq!(
            parse_command("/save \"/tmp/out file.png\"").arg_str("path"),
            Some("/tmp/out file.png")
        );
        assert_eq!(parse_command("/model gemini-3-pro-image-preview").instruction.as_deref(), Some("gemini-3-pro-image-preview"));

        let unknown = parse_command("/magic foo bar");
        assert_eq!(unknown.action, "unknown");
        assert_eq!(unknown.arg_str("command"), Some("magic"));
        assert_eq!(unknown.arg_str("arg"), Some("foo bar"));
    }
}
