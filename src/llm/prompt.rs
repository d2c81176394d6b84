use chrono::NaiveDate;

const SYSTEM_PROMPT_TEMPLATE: &str = r#"Today is {date}.
You are a phone-operating agent. Each turn you receive a screenshot of the
current screen and the foreground app, and you reply with exactly one action
that moves the task forward.

Reply format:
<think>your short reasoning</think>
<answer>one action</answer>

Actions (coordinates are on a 0-999 grid, origin at the top-left corner):
do(action="Launch", app="X")
do(action="Tap", element=[x,y])
do(action="Tap", element=[x,y], message="reason")   # payment, deletion or other sensitive taps
do(action="Type", text="X")                          # the input field must already be focused
do(action="Swipe", start=[x1,y1], end=[x2,y2])
do(action="Long Press", element=[x,y])
do(action="Double Tap", element=[x,y])
do(action="Wait", duration="2s")
do(action="Back")
do(action="Home")
finish(message="X")                                  # the task is done or cannot be done

Rules:
- Launch the target app directly instead of searching the home screen for it.
- If a page has not finished loading, Wait instead of tapping.
- If an action had no visible effect, try a different element or approach.
- Only use finish once the task is complete, and say what was done."#;

/// Message injected after a reply that could not be decoded.
pub const FORMAT_CORRECTION: &str = "Your previous reply could not be parsed. Reply again \
with <think>…</think><answer>…</answer>, where the answer is exactly one \
do(action=…) or finish(message=…) call from the action list.";

/// Text marker sent with every screenshot after the first.
pub const SCREEN_INFO_MARKER: &str = "** Screen Info **";

pub fn build_system_prompt(today: NaiveDate) -> String {
    SYSTEM_PROMPT_TEMPLATE.replace("{date}", &today.format("%Y-%m-%d").to_string())
}

/// `{"current_app": "..."}`, serialized so app names are escaped.
pub fn screen_info(current_app: Option<&str>) -> String {
    serde_json::json!({ "current_app": current_app.unwrap_or("Unknown") }).to_string()
}

/// First turn carries the task; later turns only the marker.
pub fn user_turn_text(task: Option<&str>, current_app: Option<&str>) -> String {
    let info = screen_info(current_app);
    match task {
        Some(task) if !task.is_empty() => format!("{task}\n\n{info}"),
        _ => format!("{SCREEN_INFO_MARKER}\n\n{info}"),
    }
}

/// How the assistant turn is stored in the conversation.
pub fn assistant_turn_text(thinking: &str, action: &str) -> String {
    format!("<think>{thinking}</think><answer>{action}</answer>")
}
