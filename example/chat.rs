//! minimal chat demo for bevy_llm_session.
//! - model selector (`<` / `>`), seeded from the config and extended with the
//!   models the server reports.
//! - load progress line + bar, shown only while a load is partway.
//! - full visible history; the reply grows in place while it streams.
//! - enter sends; input is refused while a reply is in flight.
//!
//! env (native): LLM_BACKEND, LLM_BASE_URL, OPENAI_API_KEY, LLM_MODEL, LLM_STREAM.
//! wasm: `?model=<id>` picks the initial model.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_llm_session::{
    ChatSession, Engine, EngineState, LlmSessionPlugin, LlmSet, ModelOption, ProviderConfig,
    ProviderEngine, ReplyErrorEvt, Role, SendRejectedEvt, SessionConfig, SessionSettings,
    UserAction,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct ProgressBar;
#[derive(Component)]
struct ProgressFill;
#[derive(Component)]
struct ModelText;
#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct PromptText;

#[derive(Component)]
struct BtnPrevModel;
#[derive(Component)]
struct BtnNextModel;

// ---------------------- app state ----------------------

#[derive(Resource, Clone)]
struct DemoProvider(ProviderConfig);

#[derive(Resource, Default)]
struct PromptBuf(String);

#[derive(Resource, Default)]
struct ModelList {
    items: Vec<ModelOption>,
    selected: usize,
    loading: bool,
    error: Option<String>,
}

#[derive(Resource, Default)]
struct PendingModelTask(Option<bevy::tasks::Task<Result<Vec<String>, String>>>);

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let config = SessionConfig::default().with_env();
    #[cfg(target_arch = "wasm32")]
    let config = config.with_location();
    let provider = ProviderConfig::default().with_env();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(Engine::new(ProviderEngine::new(provider.clone())))
        .insert_resource(DemoProvider(provider))
        .insert_resource(PromptBuf::default())
        .insert_resource(ModelList::default())
        .insert_resource(PendingModelTask::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(LlmSessionPlugin::new(config))
        .add_systems(Startup, (setup, fetch_models_startup).chain())
        .add_systems(
            Update,
            (
                handle_text_input,
                btn_prev_model,
                btn_next_model,
                poll_model_fetch_task,
                refresh_model_text,
                refresh_prompt_text,
            ),
        )
        // readers of the session run after it drained this frame
        .add_systems(
            Update,
            (refresh_status, refresh_history, on_error, on_rejected).after(LlmSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn button(row: &mut ChildSpawnerCommands, label: &str, tag: impl Component, font: &TextFont) {
    row.spawn((
        Button,
        Node {
            width: Val::Px(28.0),
            height: Val::Px(28.0),
            align_items: AlignItems::Center,
            justify_content: JustifyContent::Center,
            ..default()
        },
        BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
        tag,
    ))
    .with_children(|b| {
        b.spawn((Text::new(label), font.clone(), TextColor(Color::WHITE)));
    });
}

fn setup(mut commands: Commands, settings: Res<SessionSettings>, mut models: ResMut<ModelList>) {
    commands.spawn(Camera2d);

    models.items = settings.0.models.clone();
    models.selected = models
        .items
        .iter()
        .position(|m| m.id == settings.0.initial_model)
        .unwrap_or(0);

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // --- model box ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(6.0),
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|c| {
                // row: [<] model [>]
                c.spawn(Node {
                    column_gap: Val::Px(8.0),
                    flex_direction: FlexDirection::Row,
                    align_items: AlignItems::Center,
                    ..default()
                })
                .with_children(|row| {
                    button(row, "<", BtnPrevModel, &style_14);
                    row.spawn((
                        Text::new("model: "),
                        style_14.clone(),
                        TextColor(Color::WHITE),
                        ModelText,
                    ));
                    button(row, ">", BtnNextModel, &style_14);
                });

                c.spawn((Text::new(""), style_14.clone(), TextColor(Color::WHITE), StatusText));

                // progress bar: hidden unless a load is partway
                c.spawn((
                    Node {
                        width: Val::Percent(100.0),
                        height: Val::Px(6.0),
                        ..default()
                    },
                    BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
                    Visibility::Hidden,
                    ProgressBar,
                ))
                .with_children(|bar| {
                    bar.spawn((
                        Node {
                            width: Val::Percent(0.0),
                            height: Val::Percent(100.0),
                            ..default()
                        },
                        BackgroundColor(Color::srgb(0.35, 0.6, 0.9)),
                        ProgressFill,
                    ));
                });
            });

            // --- conversation box ---
            p.spawn(Node {
                width: Val::Percent(100.0),
                flex_grow: 1.0,
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                ..default()
            })
            .with_children(|c| {
                c.spawn((Text::new(""), style_18.clone(), TextColor(Color::WHITE), HistoryText));
                c.spawn((Text::new("> "), style_14.clone(), TextColor(Color::WHITE), PromptText));
            });
        });
}

// ---------------------- input & buttons ----------------------

fn handle_text_input(
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    session: Option<Res<ChatSession>>,
    mut ev_action: EventWriter<UserAction>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed()
            && let Some(txt) = &ev.text
        {
            prompt.0.push_str(&txt.replace(['\r', '\n'], ""));
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Enter) {
        // keep the text if the session would refuse it; the plugin still logs why
        let ready = session.as_ref().is_some_and(|s| s.can_send());
        if ready && !prompt.0.trim().is_empty() {
            let msg = std::mem::take(&mut prompt.0);
            info!(target: "chat", "submit -> len={}", msg.len());
            ev_action.write(UserAction::Submit(msg));
        }
    }
}

fn step_model(models: &mut ModelList, forward: bool) -> Option<String> {
    let n = models.items.len();
    if n == 0 {
        return None;
    }
    models.selected = if forward {
        (models.selected + 1) % n
    } else {
        (models.selected + n - 1) % n
    };
    Some(models.items[models.selected].id.clone())
}

fn btn_prev_model(
    mut q: Query<(&Interaction, &mut BackgroundColor), (Changed<Interaction>, With<BtnPrevModel>)>,
    mut models: ResMut<ModelList>,
    mut ev_action: EventWriter<UserAction>,
) {
    for (i, mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                if let Some(id) = step_model(&mut models, false) {
                    info!(target: "chat", "prev model -> '{}'", id);
                    ev_action.write(UserAction::SelectModel(id));
                }
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

fn btn_next_model(
    mut q: Query<(&Interaction, &mut BackgroundColor), (Changed<Interaction>, With<BtnNextModel>)>,
    mut models: ResMut<ModelList>,
    mut ev_action: EventWriter<UserAction>,
) {
    for (i, mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                if let Some(id) = step_model(&mut models, true) {
                    info!(target: "chat", "next model -> '{}'", id);
                    ev_action.write(UserAction::SelectModel(id));
                }
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

// ---------------------- model discovery ----------------------

fn fetch_models_startup(
    mut commands: Commands,
    provider: Res<DemoProvider>,
    mut models: ResMut<ModelList>,
) {
    let Some(url) = provider.0.models_url() else {
        return;
    };
    info!(target: "chat", "fetch models -> {}", url);
    let api_key = provider.0.api_key.clone();

    #[cfg(not(target_arch = "wasm32"))]
    let task = bevy::tasks::IoTaskPool::get().spawn(async move {
        // ureq is blocking; do it inside this worker
        let agent = ureq::Agent::new_with_defaults();
        let mut req = agent.get(&url).header("accept", "application/json");
        if let Some(k) = api_key.as_ref() {
            req = req.header("authorization", &format!("Bearer {}", k));
        }
        let res = req.call().map_err(|e| e.to_string())?;
        let text = res.into_body().read_to_string().map_err(|e| e.to_string())?;
        parse_model_ids(&text)
    });

    #[cfg(target_arch = "wasm32")]
    let task = bevy::tasks::IoTaskPool::get().spawn(async move {
        use gloo_net::http::Request;
        let mut req = Request::get(&url).header("accept", "application/json");
        if let Some(k) = api_key.as_ref() {
            req = req.header("authorization", &format!("Bearer {}", k));
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        let text = resp.text().await.map_err(|e| e.to_string())?;
        parse_model_ids(&text)
    });

    commands.insert_resource(PendingModelTask(Some(task)));
    models.loading = true;
    models.error = None;
}

fn parse_model_ids(text: &str) -> Result<Vec<String>, String> {
    // expect openai-style: { "data": [ { "id": "...", ... }, ... ] }
    let v: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let ids: Vec<String> = v
        .get("data")
        .and_then(|d| d.as_array())
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err("no models found".into());
    }
    Ok(ids)
}

fn poll_model_fetch_task(mut task_res: ResMut<PendingModelTask>, mut models: ResMut<ModelList>) {
    use bevy::tasks::futures_lite::future;

    let Some(task) = task_res.0.as_mut() else {
        return;
    };
    let Some(result) = future::block_on(future::poll_once(task)) else {
        return;
    };
    models.loading = false;
    match result {
        Ok(ids) => {
            info!(target: "chat", "models fetched: {}", ids.len());
            // configured entries keep their labels; discovered ones are appended
            for id in ids {
                if !models.items.iter().any(|m| m.id == id) {
                    models.items.push(ModelOption::new(id.clone(), id));
                }
            }
        }
        Err(e) => {
            warn!(target: "chat", "model fetch error: {}", e);
            models.error = Some(e);
        }
    }
    task_res.0 = None;
}

// ---------------------- text refresh ----------------------

fn refresh_model_text(models: Res<ModelList>, mut q: Query<&mut Text, With<ModelText>>) {
    if !models.is_changed() {
        return;
    }
    let Ok(mut t) = q.single_mut() else {
        return;
    };
    let label = models
        .items
        .get(models.selected)
        .map(|m| m.label.as_str())
        .unwrap_or("<none>");
    t.0 = if models.loading {
        format!("model: {} (discovering...)", label)
    } else if let Some(err) = &models.error {
        format!("model: {} [discovery failed: {err}]", label)
    } else {
        format!("model: {}", label)
    };
}

fn refresh_status(
    session: Option<Res<ChatSession>>,
    mut q_text: Query<&mut Text, With<StatusText>>,
    mut q_bar: Query<&mut Visibility, With<ProgressBar>>,
    mut q_fill: Query<&mut Node, With<ProgressFill>>,
) {
    let Some(session) = session.filter(|s| s.is_changed()) else {
        return;
    };
    let (status, bar) = match session.engine_state() {
        EngineState::LoadingModel { model, progress } => {
            let line = if progress.text().is_empty() {
                format!("loading {model}: {}%", progress.percent())
            } else {
                format!("loading {model}: {} ({}%)", progress.text(), progress.percent())
            };
            (line, progress.shows_bar().then(|| progress.fraction()))
        }
        EngineState::Ready { model, .. } => {
            let usage = session
                .last_usage()
                .map(|u| format!(" ({} tokens last reply)", u.total()))
                .unwrap_or_default();
            (format!("ready: {model}{usage}"), None)
        }
        EngineState::Error { model, message } => (format!("error ({model}): {message}"), None),
    };

    if let Ok(mut t) = q_text.single_mut() {
        t.0 = status;
    }
    if let Ok(mut vis) = q_bar.single_mut() {
        *vis = if bar.is_some() { Visibility::Inherited } else { Visibility::Hidden };
    }
    if let (Some(f), Ok(mut node)) = (bar, q_fill.single_mut()) {
        node.width = Val::Percent(f * 100.0);
    }
}

fn refresh_history(session: Option<Res<ChatSession>>, mut q: Query<&mut Text, With<HistoryText>>) {
    let Some(session) = session.filter(|s| s.is_changed()) else {
        return;
    };
    let Ok(mut t) = q.single_mut() else {
        return;
    };
    let mut out = String::new();
    for m in session.conversation().displayed() {
        let who = match m.role {
            Role::User => "user",
            _ => "assistant",
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(&m.content);
        out.push('\n');
    }
    t.0 = out;
}

fn refresh_prompt_text(
    prompt: Res<PromptBuf>,
    session: Option<Res<ChatSession>>,
    mut q_prompt: Query<&mut Text, With<PromptText>>,
) {
    let replying = session.as_ref().is_some_and(|s| s.is_replying());
    let session_changed = session.as_ref().is_some_and(|s| s.is_changed());
    if !prompt.is_changed() && !session_changed {
        return;
    }
    if let Ok(mut t) = q_prompt.single_mut() {
        let hint = if replying { "  (replying...)" } else { " |" };
        t.0 = format!("> {}{}", prompt.0, hint);
    }
}

// ---------------------- session events ----------------------

fn on_error(mut ev: EventReader<ReplyErrorEvt>) {
    for ReplyErrorEvt { request, error } in ev.read() {
        error!(target: "chat", "reply {:?} failed: {}", request, error);
    }
}

fn on_rejected(mut ev: EventReader<SendRejectedEvt>) {
    for SendRejectedEvt { reason } in ev.read() {
        warn!(target: "chat", "send rejected: {}", reason);
    }
}
