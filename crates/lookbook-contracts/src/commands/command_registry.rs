#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole tail is free text.
pub(crate) const TEXT_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "apply",
        action: "apply_mask",
    },
    CommandSpec {
        command: "pose",
        action: "pose",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "save",
        action: "save",
    },
    CommandSpec {
        command: "open",
        action: "open",
    },
];

pub(crate) const STROKE_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "brush",
        action: "brush",
    },
    CommandSpec {
        command: "erase",
        action: "erase",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "undo",
        action: "undo",
    },
    CommandSpec {
        command: "redo",
        action: "redo",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "clear_mask",
        action: "clear_mask",
    },
    CommandSpec {
        command: "invert_mask",
        action: "invert_mask",
    },
    CommandSpec {
        command: "cost",
        action: "cost",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub const EDITOR_HELP_COMMANDS: &[&str] = &[
    "/point <x> <y> <instruction>",
    "/mask <mask.png> <instruction>",
    "/brush <x,y> <x,y> ... [r=<radius>]",
    "/erase <x,y> <x,y> ... [r=<radius>]",
    "/clear_mask",
    "/invert_mask",
    "/apply <instruction>",
    "/crop <x> <y> <w> <h>",
    "/resize <w>x<h>",
    "/expand <ratio>",
    "/pose <description>",
    "/model <name>",
    "/undo",
    "/redo",
    "/history",
    "/cost",
    "/open <path>",
    "/save <path>",
    "/help",
];
