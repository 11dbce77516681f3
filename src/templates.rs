// ABOUTME: Default luabot.lua written by `luabot init <kind>`
// ABOUTME: A shared skeleton (worker, http/https entry points) around a per-backend bot block

use luabot_core::config::BackendKind;

const PRELUDE: &str = r#"local luabot = require("luabot")
local json = require("json")
-- local charset = require("charset")
-- local re = require("re")
-- local requests = require("requests")
-- local fs = require("fs")
-- local sh = require("sh")

function main()
  msglog = luabot.newlogger({type = "console", format = "%Date %Msg"})
"#;

const IRC_BOT: &str = r#"  mynick = "luabot"
  local bot = luabot.newbot("IRC", {
    nickname = mynick,
    username = "luabot",
    conn = "localhost:6667,#test",
    useTLS = false,
    worker = 3,
    http = "0.0.0.0:6669",
    log = {type = "console", format = "%Date [%Level] %Msg"},
  })

  bot:on("PRIVMSG", function(e)
    local ch = e.arguments[1]
    if e.nick == mynick then
      return
    end
    msglog:printf("%s\t%s\t%s", ch, e.source, e.message)
    goworker({channel = ch, message = e.message, nick = e.nick})
  end)

  bot:respond([[\s*(\d+)\s*\+\s*(\d+)\s*]], function(m, e)
    bot:say(e.target, tostring(tonumber(m[2]) + tonumber(m[3])))
  end)
"#;

const SLACK_BOT: &str = r#"  local bot = luabot.newbot("Slack", {
    token = "xoxb-",
    app_token = "xapp-",
    http = "0.0.0.0:6669",
    log = {type = "console", format = "%Date [%Level] %Msg"},
  })

  bot:on("message", function(e)
    if (e.subtype or "") == "" then
      msglog:printf("%s\t%s\t%s", e.channel, e.user, e.text)
      goworker({channel = e.channel, message = e.text})
    end
  end)

  bot:respond([[\s*(\d+)\s*\+\s*(\d+)\s*]], function(m, e)
    bot:say(e.target, tostring(tonumber(m[2]) + tonumber(m[3])))
  end)
"#;

const HIPCHAT_BOT: &str = r#"  local bot = luabot.newbot("Hipchat", {
    user = "111111_111111",
    password = "password",
    host = "chat.hipchat.com",
    conf = "conf.hipchat.com",
    auth_type = "plain",
    room_jids = {"111111_xxxxx@conf.hipchat.com"},
    http = "0.0.0.0:6669",
    log = {type = "console", format = "%Date [%Level] %Msg"},
  })

  bot:respond([[\s*(\d+)\s*\+\s*(\d+)\s*]], function(m, e)
    bot:say(e.target, tostring(tonumber(m[2]) + tonumber(m[3])))
  end)
"#;

const ROCKET_BOT: &str = r#"  local bot = luabot.newbot("Rocket", {
    url = "http://localhost:3000",
    name = "luabot",
    email = "luabot@example.com",
    password = "password",
    channels = "general",
    http = "0.0.0.0:6669",
    log = {type = "console", format = "%Date [%Level] %Msg"},
  })

  bot:on("message", function(e)
    msglog:printf("%s\t%s\t%s", e.channel, e.user.username, e.text)
  end)

  bot:respond([[\s*(\d+)\s*\+\s*(\d+)\s*]], function(m, e)
    bot:say(e.target, tostring(tonumber(m[2]) + tonumber(m[3])))
  end)
"#;

const NULL_BOT: &str = r#"  local bot = luabot.newbot("Null", {
    http = "0.0.0.0:6669",
    log = {type = "console", format = "%Date [%Level] %Msg"},
  })
"#;

const SERVE_AND_ENTRY_POINTS: &str = r#"
  bot:serve(function(msg)
    if msg.type == "say" then
      bot:say(msg.channel, msg.message)
      respond(msg, true)
    end
  end)
end

function worker(msg)
  notifymain({type = "say", channel = msg.channel, message = "accepted"})
end

local function reply(status, content_type, body)
  return status, {{"Content-Type", content_type}}, body
end

function http(req)
  if req.method == "POST" and req.path == "/privmsg" then
    local msg = json.decode(req:read())
    if msg == nil then
      return reply(406, "application/json; charset=utf-8", json.encode({result = "error"}))
    end
    local ok, success = requestmain({type = "say", channel = msg.channel, message = msg.message})
    if ok and success then
      return reply(200, "application/json; charset=utf-8", json.encode({result = "ok"}))
    end
    return reply(406, "application/json; charset=utf-8", json.encode({result = "error"}))
  end
  return reply(400, "text/plain; charset=utf-8", "NOT FOUND")
end

function https(req)
  return http(req)
end
"#;

/// Complete default script for `kind`
pub fn default_config(kind: BackendKind) -> String {
    let bot = match kind {
        BackendKind::Irc => IRC_BOT,
        BackendKind::Slack => SLACK_BOT,
        BackendKind::Hipchat => HIPCHAT_BOT,
        BackendKind::Rocket => ROCKET_BOT,
        BackendKind::Null => NULL_BOT,
    };
    [PRELUDE, bot, SERVE_AND_ENTRY_POINTS].concat()
}
