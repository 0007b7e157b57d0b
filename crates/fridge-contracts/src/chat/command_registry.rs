#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "meal",
        action: "set_meal_time",
        arg_key: "meal_time",
    },
    CommandSpec {
        command: "text_model",
        action: "set_text_model",
        arg_key: "model",
    },
    CommandSpec {
        command: "image_model",
        action: "set_image_model",
        arg_key: "model",
    },
];

pub(crate) const INDEX_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "show",
    action: "open_detail",
    arg_key: "index",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
    CommandSpec {
        command: "close",
        action: "close_detail",
        arg_key: "",
    },
    CommandSpec {
        command: "list",
        action: "list",
        arg_key: "",
    },
    CommandSpec {
        command: "retry",
        action: "retry",
        arg_key: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg_key: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg_key: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/meal <아침|점심|저녁>",
    "/show <1-3>",
    "/close",
    "/list",
    "/retry",
    "/text_model <model>",
    "/image_model <model>",
    "/help",
    "/quit",
];
